//! End-to-end session flows over an in-memory transport.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tether_core::{GroupOptions, Router, RouterConfig, Session, SessionConfig, WebhookSet};
use tether_protocol::codec::{
    self, close_code, response_code, InitiationRequest, InitiationResponse, RequestHeader,
    ResponseHeader, PROTOCOL_VERSION,
};
use tether_protocol::{AuthKey, GroupId, Uid};
use tether_transport::{memory, BoxedIo};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const OBJECT_KEY: AuthKey = [0x11; 16];
const CENTRAL_KEY: AuthKey = [0x22; 16];

struct Broker {
    router: Arc<Router>,
    config: SessionConfig,
    _dir: TempDir,
}

impl Broker {
    fn start() -> Self {
        Self::with_session_config(SessionConfig::default())
    }

    fn with_session_config(config: SessionConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let mut groups = HashMap::new();
        groups.insert(
            GroupId::from_name("sensors").unwrap(),
            GroupOptions { telemetry: true, telemetry_token_exp_min: None },
        );
        let router = Arc::new(Router::new(
            RouterConfig {
                acl_path: dir.path().join("acl.json"),
                central_auth_key: CENTRAL_KEY,
                keep_session: Duration::from_secs(60),
            },
            groups,
            WebhookSet::default(),
        ));
        Broker { router, config, _dir: dir }
    }

    fn grant(&self, uid: Uid) {
        self.router
            .replace_acl(vec![codec::AclItem {
                group: GroupId::from_name("sensors").unwrap(),
                uid,
                key: OBJECT_KEY,
            }])
            .unwrap();
    }

    /// Connect a peer and complete initiation plus authentication.
    async fn connect(&self, uid: Uid, key: &AuthKey) -> BoxedIo {
        let (mut client, server) = memory::pair(16 * 1024);
        let session = Session::new(Arc::clone(&self.router), None, self.config);
        tokio::spawn(session.run(server));

        let init = InitiationRequest {
            tls: false,
            version: PROTOCOL_VERSION,
            options: 0x00,
            max_transmission_len: 2048,
        };
        client.write_all(&init.encode()).await.unwrap();

        let mut resp = [0u8; InitiationResponse::LEN];
        client.read_exact(&mut resp).await.unwrap();
        assert!(InitiationResponse::decode(&resp).unwrap().accepted);

        let mut nonce = [0u8; 16];
        client.read_exact(&mut nonce).await.unwrap();
        let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
        mac.update(&nonce);
        let digest: [u8; 32] = mac.finalize().into_bytes().into();
        client
            .write_all(&codec::make_challenge_response(&uid, &digest))
            .await
            .unwrap();

        let mut validation = [0u8; 1];
        client.read_exact(&mut validation).await.unwrap();
        assert_eq!(validation[0], 0x01);
        client
    }
}

async fn read_routed_uid(io: &mut BoxedIo) -> Uid {
    let mut uid = [0u8; 16];
    io.read_exact(&mut uid).await.unwrap();
    Uid::from_bytes(uid)
}

async fn read_request(io: &mut BoxedIo) -> (RequestHeader, Vec<u8>) {
    let mut header = [0u8; RequestHeader::LEN];
    io.read_exact(&mut header).await.unwrap();
    let header = RequestHeader::decode(&header).unwrap();
    let mut data = vec![0u8; usize::from(header.payload.len)];
    io.read_exact(&mut data).await.unwrap();
    (header, data)
}

async fn read_response(io: &mut BoxedIo) -> (ResponseHeader, Vec<u8>) {
    let mut header = [0u8; ResponseHeader::LEN];
    io.read_exact(&mut header).await.unwrap();
    let header = ResponseHeader::decode(&header).unwrap();
    let mut data = vec![0u8; usize::from(header.payload.len)];
    io.read_exact(&mut data).await.unwrap();
    (header, data)
}

#[tokio::test]
async fn object_receives_telemetry_token_after_auth() {
    let broker = Broker::start();
    let uid = Uid::from_name("sensor-1").unwrap();
    broker.grant(uid);

    let mut client = broker.connect(uid, &OBJECT_KEY).await;
    let mut frame = [0u8; 9];
    client.read_exact(&mut frame).await.unwrap();
    assert_eq!(frame[0], 0x50);
    assert_ne!(&frame[1..], &[0u8; 8]);
}

#[tokio::test]
async fn bad_key_is_refused() {
    let broker = Broker::start();
    let uid = Uid::from_name("sensor-1").unwrap();
    broker.grant(uid);

    let (mut client, server) = memory::pair(4096);
    let session = Session::new(Arc::clone(&broker.router), None, broker.config);
    tokio::spawn(session.run(server));

    let init = InitiationRequest {
        tls: false,
        version: PROTOCOL_VERSION,
        options: 0x00,
        max_transmission_len: 2048,
    };
    client.write_all(&init.encode()).await.unwrap();
    let mut resp = [0u8; 2];
    client.read_exact(&mut resp).await.unwrap();

    let mut nonce = [0u8; 16];
    client.read_exact(&mut nonce).await.unwrap();
    let wrong = [0x99u8; 16];
    let mut mac = Hmac::<Sha256>::new_from_slice(&wrong).unwrap();
    mac.update(&nonce);
    let digest: [u8; 32] = mac.finalize().into_bytes().into();
    client
        .write_all(&codec::make_challenge_response(&uid, &digest))
        .await
        .unwrap();

    let mut validation = [0u8; 1];
    client.read_exact(&mut validation).await.unwrap();
    assert_eq!(validation[0], 0x00);
    // Connection ends after the refusal.
    assert_eq!(client.read(&mut [0u8; 1]).await.unwrap(), 0);
}

#[tokio::test]
async fn ping_gets_pong() {
    let broker = Broker::start();
    let uid = Uid::from_name("sensor-1").unwrap();
    broker.grant(uid);

    let mut client = broker.connect(uid, &OBJECT_KEY).await;
    let mut token = [0u8; 9];
    client.read_exact(&mut token).await.unwrap();

    client.write_all(&codec::make_ping()).await.unwrap();
    let mut pong = [0u8; 1];
    client.read_exact(&mut pong).await.unwrap();
    assert_eq!(pong[0], 0x20);
}

#[tokio::test]
async fn request_to_absent_central_gets_no_destination() {
    let broker = Broker::start();
    let uid = Uid::from_name("sensor-1").unwrap();
    broker.grant(uid);

    let mut client = broker.connect(uid, &OBJECT_KEY).await;
    let mut token = [0u8; 9];
    client.read_exact(&mut token).await.unwrap();

    let request = codec::make_request(None, 5, 0x02, 0x00, b"hello").unwrap();
    client.write_all(&request).await.unwrap();

    let mut header = [0u8; 1];
    client.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0], 0x40);
    let (response, data) = read_response(&mut client).await;
    assert_eq!(response.tracking, 5);
    assert_eq!(response.code, response_code::NO_DESTINATION);
    assert!(data.is_empty());
}

#[tokio::test]
async fn object_to_object_request_response() {
    let broker = Broker::start();
    let uid_a = Uid::from_name("sensor-a").unwrap();
    let uid_b = Uid::from_name("sensor-b").unwrap();
    broker.router
        .replace_acl(vec![
            codec::AclItem { group: GroupId::from_name("sensors").unwrap(), uid: uid_a, key: OBJECT_KEY },
            codec::AclItem { group: GroupId::from_name("sensors").unwrap(), uid: uid_b, key: OBJECT_KEY },
        ])
        .unwrap();

    let mut a = broker.connect(uid_a, &OBJECT_KEY).await;
    let mut b = broker.connect(uid_b, &OBJECT_KEY).await;
    let mut token = [0u8; 9];
    a.read_exact(&mut token).await.unwrap();
    b.read_exact(&mut token).await.unwrap();

    let request = codec::make_request(Some(&uid_b), 42, 0x02, 0x00, b"read").unwrap();
    a.write_all(&request).await.unwrap();

    // B sees the request tagged with the sender's identity.
    let mut header = [0u8; 1];
    b.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0], 0x38);
    assert_eq!(read_routed_uid(&mut b).await, uid_a);
    let (req, data) = read_request(&mut b).await;
    assert_eq!(req.tracking, 42);
    assert_eq!(data, b"read");

    // Resending the tracking number while it is outstanding is refused.
    a.write_all(&request).await.unwrap();
    let mut header = [0u8; 1];
    a.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0], 0x48);
    assert_eq!(read_routed_uid(&mut a).await, uid_b);
    let (dup, _) = read_response(&mut a).await;
    assert_eq!(dup.code, response_code::DUPLICATE_TRACKING);

    // B answers; A's wait ends with the real response.
    let response = codec::make_response(Some(&uid_a), 42, response_code::OK, 0x02, 0x00, b"21.5C").unwrap();
    b.write_all(&response).await.unwrap();

    let mut header = [0u8; 1];
    a.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0], 0x48);
    assert_eq!(read_routed_uid(&mut a).await, uid_b);
    let (resp, data) = read_response(&mut a).await;
    assert_eq!(resp.tracking, 42);
    assert_eq!(resp.code, response_code::OK);
    assert_eq!(data, b"21.5C");
}

#[tokio::test]
async fn sleeping_central_retains_requests_until_return() {
    let broker = Broker::start();
    let uid = Uid::from_name("sensor-1").unwrap();
    broker.grant(uid);

    let mut object = broker.connect(uid, &OBJECT_KEY).await;
    let mut token = [0u8; 9];
    object.read_exact(&mut token).await.unwrap();

    let mut central = broker.connect(Uid::CENTRAL, &CENTRAL_KEY).await;

    // Live central receives the request directly.
    let request = codec::make_request(None, 1, 0x02, 0x00, b"one").unwrap();
    object.write_all(&request).await.unwrap();
    let mut header = [0u8; 1];
    central.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0], 0x38);
    assert_eq!(read_routed_uid(&mut central).await, uid);
    let (req, _) = read_request(&mut central).await;
    assert_eq!(req.tracking, 1);

    // Central goes to sleep; requests are held for it.
    central
        .write_all(&codec::make_close(close_code::SLEEP_MODE))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let request = codec::make_request(None, 2, 0x02, 0x00, b"two").unwrap();
    object.write_all(&request).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // On return the retained frame arrives right after validation.
    let mut central = broker.connect(Uid::CENTRAL, &CENTRAL_KEY).await;
    let mut header = [0u8; 1];
    central.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0], 0x38);
    assert_eq!(read_routed_uid(&mut central).await, uid);
    let (req, data) = read_request(&mut central).await;
    assert_eq!(req.tracking, 2);
    assert_eq!(data, b"two");
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let broker = Broker::with_session_config(SessionConfig {
        request_timeout: Duration::from_millis(50),
        ..SessionConfig::default()
    });
    let uid_a = Uid::from_name("sensor-a").unwrap();
    let uid_b = Uid::from_name("sensor-b").unwrap();
    broker.router
        .replace_acl(vec![
            codec::AclItem { group: GroupId::from_name("sensors").unwrap(), uid: uid_a, key: OBJECT_KEY },
            codec::AclItem { group: GroupId::from_name("sensors").unwrap(), uid: uid_b, key: OBJECT_KEY },
        ])
        .unwrap();

    let mut a = broker.connect(uid_a, &OBJECT_KEY).await;
    let mut b = broker.connect(uid_b, &OBJECT_KEY).await;
    let mut token = [0u8; 9];
    a.read_exact(&mut token).await.unwrap();
    b.read_exact(&mut token).await.unwrap();

    let request = codec::make_request(Some(&uid_b), 7, 0x02, 0x00, b"ask").unwrap();
    a.write_all(&request).await.unwrap();

    // Wait until the broker has handed B the request, then expire it.
    let mut header = [0u8; 1];
    b.read_exact(&mut header).await.unwrap();
    read_routed_uid(&mut b).await;
    read_request(&mut b).await;
    broker.router.sweep(Instant::now() + Duration::from_secs(1));

    let mut header = [0u8; 1];
    a.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0], 0x48);
    assert_eq!(read_routed_uid(&mut a).await, uid_b);
    let (resp, _) = read_response(&mut a).await;
    assert_eq!(resp.tracking, 7);
    assert_eq!(resp.code, response_code::TIMEOUT);
}

#[tokio::test]
async fn telemetry_reaches_live_central() {
    let broker = Broker::start();
    let uid = Uid::from_name("sensor-1").unwrap();
    broker.grant(uid);

    let mut object = broker.connect(uid, &OBJECT_KEY).await;
    let mut token_frame = [0u8; 9];
    object.read_exact(&mut token_frame).await.unwrap();
    let mut token = [0u8; 8];
    token.copy_from_slice(&token_frame[1..]);

    let mut central = broker.connect(Uid::CENTRAL, &CENTRAL_KEY).await;

    broker.router.route_telemetry(&token, 0x02, 0x00, b"42").unwrap();

    let mut header = [0u8; 1];
    central.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0], 0x68);
    assert_eq!(read_routed_uid(&mut central).await, uid);
    let mut payload_header = [0u8; 3];
    central.read_exact(&mut payload_header).await.unwrap();
    let mut data = vec![0u8; usize::from(u16::from_be_bytes([payload_header[1], payload_header[2]]))];
    central.read_exact(&mut data).await.unwrap();
    assert_eq!(data, b"42");
}

#[tokio::test]
async fn malformed_header_closes_with_protocol_error() {
    let broker = Broker::start();
    let uid = Uid::from_name("sensor-1").unwrap();
    broker.grant(uid);

    let mut client = broker.connect(uid, &OBJECT_KEY).await;
    let mut token = [0u8; 9];
    client.read_exact(&mut token).await.unwrap();

    // 0x7 is not a transmission type.
    client.write_all(&[0x70]).await.unwrap();
    let mut close = [0u8; 2];
    client.read_exact(&mut close).await.unwrap();
    assert_eq!(close, [0xF0, close_code::PROTOCOL_ERROR]);
    assert_eq!(client.read(&mut [0u8; 1]).await.unwrap(), 0);
}

#[tokio::test]
async fn oversized_acl_push_is_refused() {
    let broker = Broker::start();
    let mut central = broker.connect(Uid::CENTRAL, &CENTRAL_KEY).await;

    // A declared count in the millions never gets buffered.
    central
        .write_all(&codec::make_acl_header(5_000_000))
        .await
        .unwrap();
    let mut close = [0u8; 2];
    central.read_exact(&mut close).await.unwrap();
    assert_eq!(close, [0xF0, close_code::PROTOCOL_ERROR]);
    assert_eq!(central.read(&mut [0u8; 1]).await.unwrap(), 0);
}

#[tokio::test]
async fn central_pushes_acl_update() {
    let broker = Broker::start();
    let uid = Uid::from_name("sensor-1").unwrap();

    let mut central = broker.connect(Uid::CENTRAL, &CENTRAL_KEY).await;

    let item = codec::AclItem {
        group: GroupId::from_name("sensors").unwrap(),
        uid,
        key: OBJECT_KEY,
    };
    central.write_all(&codec::make_acl_header(1)).await.unwrap();
    central.write_all(&item.encode()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The pushed identity can now authenticate.
    let mut client = broker.connect(uid, &OBJECT_KEY).await;
    let mut token = [0u8; 9];
    client.read_exact(&mut token).await.unwrap();
}
