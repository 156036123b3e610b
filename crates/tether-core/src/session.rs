//! Per-connection protocol session.
//!
//! Each accepted connection runs one [`Session`] task:
//! initiation → optional TLS upgrade → challenge/HMAC authentication →
//! framed data loop. Frames on a connection are handled strictly in
//! arrival order; the next read is only issued once the current frame is
//! fully processed. Outbound frames from the router are queued on the
//! session's channel and drained by a dedicated writer task, so a slow
//! reader never blocks delivery.

use crate::router::Router;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_protocol::codec::{
    self, close_code, response_code, AclItem, CodecError, InitiationRequest, InitiationResponse,
    RequestHeader, ResponseHeader, TransmissionType, ACL_ITEM_LEN, CHALLENGE_RESPONSE_LEN,
    NONCE_LEN, PROTOCOL_VERSION,
};
use tether_protocol::Uid;
use tether_transport::{BoxedIo, TlsUpgrade};
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

static SESSION_ID: AtomicU64 = AtomicU64::new(0);

/// Largest item count accepted in one ACL push; bounds the buffered table
/// even when the declared count is garbage.
const MAX_ACL_PUSH_ITEMS: u32 = 10_000;

/// Session failures.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A receive operation exceeded its timeout.
    #[error("receive timed out")]
    RecvTimeout,

    /// Malformed wire data.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Initiation was rejected (version mismatch or TLS unavailable).
    #[error("initiation rejected")]
    InitiationRejected,

    /// Challenge verification failed.
    #[error("authentication failed")]
    AuthFailed,
}

/// A request awaiting its response.
#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    /// Destination the request was routed to (`None` for central).
    dest: Option<Uid>,
    expires_at: Instant,
}

/// Shared handle to a live session, registered with the router.
///
/// Frame delivery is a queue push, never a network call, so it is safe
/// under the router lock. The pending-request map has its own lock; lock
/// order is always router before session.
pub struct SessionHandle {
    id: u64,
    uid: Uid,
    outbound: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
    pending: Mutex<HashMap<u16, PendingRequest>>,
}

impl SessionHandle {
    /// Create a handle and the receiving side of its outbound queue.
    #[must_use]
    pub fn new(uid: Uid) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(Self {
            id: SESSION_ID.fetch_add(1, Ordering::Relaxed),
            uid,
            outbound: tx,
            cancel: CancellationToken::new(),
            pending: Mutex::new(HashMap::new()),
        });
        (handle, rx)
    }

    /// The identity the session authenticated as.
    #[must_use]
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// Whether this is the central session.
    #[must_use]
    pub fn is_central(&self) -> bool {
        self.uid.is_central()
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Queue a frame for delivery. Returns `false` once the session is
    /// closing or gone.
    pub fn send(&self, frame: Bytes) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.outbound.send(frame).is_ok()
    }

    /// Ask the session to shut down (preemption, broker shutdown).
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Resolves when the session has been asked to shut down.
    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Register an outstanding request. Returns `false` if the tracking
    /// number is already pending.
    pub(crate) fn begin_tracking(&self, tracking: u16, dest: Option<Uid>, expires_at: Instant) -> bool {
        let mut pending = self.pending.lock();
        if pending.contains_key(&tracking) {
            return false;
        }
        pending.insert(tracking, PendingRequest { dest, expires_at });
        true
    }

    /// Drop an outstanding request, ending its wait.
    pub(crate) fn end_tracking(&self, tracking: u16) {
        self.pending.lock().remove(&tracking);
    }

    /// Expire outstanding requests, sending a synthetic timeout response
    /// for each one past its deadline.
    pub(crate) fn sweep_pending(&self, now: Instant) {
        let expired: Vec<(u16, PendingRequest)> = {
            let mut pending = self.pending.lock();
            let dead: Vec<u16> = pending
                .iter()
                .filter(|(_, req)| now >= req.expires_at)
                .map(|(&n, _)| n)
                .collect();
            dead.into_iter()
                .filter_map(|n| pending.remove(&n).map(|req| (n, req)))
                .collect()
        };
        for (tracking, req) in expired {
            debug!(uid = %self.uid, tracking, "request timed out");
            self.send(codec::make_response_error(
                req.dest.as_ref(),
                tracking,
                response_code::TIMEOUT,
            ));
        }
    }
}

/// Session timing configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Deadline for a routed request to receive its response.
    pub request_timeout: Duration,
    /// Timeout for every handshake and mid-frame receive.
    pub recv_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            recv_timeout: Duration::from_secs(2),
        }
    }
}

/// One connection's protocol state machine.
pub struct Session {
    router: Arc<Router>,
    tls: Option<Arc<dyn TlsUpgrade>>,
    config: SessionConfig,
}

enum LoopEnd {
    /// Peer sent CloseConnection with this code.
    PeerClosed(u8),
    /// We were cancelled (preempted or broker shutdown).
    Cancelled,
}

impl Session {
    #[must_use]
    pub fn new(router: Arc<Router>, tls: Option<Arc<dyn TlsUpgrade>>, config: SessionConfig) -> Self {
        Self { router, tls, config }
    }

    /// Drive the connection until it closes.
    ///
    /// # Errors
    ///
    /// Returns the failure that ended the connection; orderly closes are
    /// `Ok`.
    pub async fn run(self, io: BoxedIo) -> Result<(), SessionError> {
        let result = self.establish(io).await;
        match &result {
            Ok(()) => {}
            Err(SessionError::InitiationRejected) => debug!("initiation rejected"),
            Err(SessionError::AuthFailed) => debug!("authentication refused"),
            Err(e) => debug!(error = %e, "session ended"),
        }
        result
    }

    async fn establish(&self, mut io: BoxedIo) -> Result<(), SessionError> {
        // Initiation: 4 bytes, accept iff the version matches and TLS is
        // available when requested.
        let mut init_buf = [0u8; InitiationRequest::LEN];
        self.recv_exact(&mut io, &mut init_buf).await?;
        let init = InitiationRequest::decode(&init_buf)?;
        let ok = init.version == PROTOCOL_VERSION && (!init.tls || self.tls.is_some());

        io.write_all(&InitiationResponse::new(ok).encode()).await?;
        if !ok {
            debug!(version = init.version, tls = init.tls, "initiation refused");
            return Err(SessionError::InitiationRejected);
        }
        if init.tls {
            // The upgrader is present when `ok` held.
            let tls = self.tls.as_ref().ok_or(SessionError::InitiationRejected)?;
            io = tls.upgrade(io).await?;
        }

        // Challenge: 16 random bytes out, UID + HMAC-SHA-256 back.
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        io.write_all(&nonce).await?;

        let mut reply = [0u8; CHALLENGE_RESPONSE_LEN];
        self.recv_exact(&mut io, &mut reply).await?;
        let (uid, digest) = codec::decode_challenge_response(&reply)?;

        let (handle, rx) = SessionHandle::new(uid);
        if self.router.authenticate(&handle, &nonce, &digest).is_err() {
            io.write_all(&codec::make_auth_validation(false)).await?;
            return Err(SessionError::AuthFailed);
        }

        // Authenticated: split the stream, drain the outbound queue from a
        // writer task (auth validation and any retained frames are already
        // queued), and run the data loop on the read half.
        let (mut reader, writer) = split(io);
        let writer_task = spawn_writer(handle.cancel.clone(), writer, rx);

        let outcome = self.data_loop(&mut reader, &handle).await;

        let closed_code = match &outcome {
            Ok(LoopEnd::PeerClosed(code)) => Some(*code),
            Ok(LoopEnd::Cancelled) | Err(_) => None,
        };
        let keep = matches!(
            closed_code,
            None | Some(close_code::SLEEP_MODE) | Some(close_code::FLUSH_RESOURCES)
        );
        self.router.remove_session(&handle, keep);
        debug!(uid = %handle.uid, ?closed_code, keep, "session closed");

        // Dropping the handle closes the queue; the writer drains whatever
        // is left (including a final close frame) and exits.
        drop(handle);
        let _ = writer_task.await;
        outcome.map(|_| ())
    }

    async fn data_loop(
        &self,
        reader: &mut ReadHalf<BoxedIo>,
        handle: &Arc<SessionHandle>,
    ) -> Result<LoopEnd, SessionError> {
        loop {
            // Idle wait for the next transmission header; no timeout, but
            // cancellable for preemption.
            let header = tokio::select! {
                () = handle.cancelled() => return Ok(LoopEnd::Cancelled),
                byte = reader.read_u8() => byte?,
            };

            let (tot, routed) = match codec::decode_transmission_header(header) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(uid = %handle.uid, error = %e, "protocol error");
                    handle.send(codec::make_close(close_code::PROTOCOL_ERROR));
                    return Err(e.into());
                }
            };
            let dest = if routed {
                let mut uid_buf = [0u8; 16];
                self.recv_exact(reader, &mut uid_buf).await?;
                Some(Uid::from_bytes(uid_buf))
            } else {
                None
            };

            match tot {
                TransmissionType::Acl if handle.is_central() => {
                    self.handle_acl_push(reader, handle).await?;
                }
                TransmissionType::Ping => {
                    handle.send(codec::make_pong());
                }
                TransmissionType::Pong => {}
                TransmissionType::Request => {
                    self.handle_request(reader, handle, dest).await?;
                }
                TransmissionType::Response => {
                    self.handle_response(reader, handle, dest).await?;
                }
                TransmissionType::CloseConnection => {
                    let mut code = [0u8; 1];
                    self.recv_exact(reader, &mut code).await?;
                    return Ok(LoopEnd::PeerClosed(code[0]));
                }
                other => {
                    warn!(uid = %handle.uid, ?other, "unexpected transmission type");
                    handle.send(codec::make_close(close_code::PROTOCOL_ERROR));
                    return Err(CodecError::UnknownTransmission(other as u8).into());
                }
            }
        }
    }

    async fn handle_acl_push(
        &self,
        reader: &mut ReadHalf<BoxedIo>,
        handle: &Arc<SessionHandle>,
    ) -> Result<(), SessionError> {
        let mut count_buf = [0u8; 4];
        self.recv_exact(reader, &mut count_buf).await?;
        let count = u32::from_be_bytes(count_buf);
        if count > MAX_ACL_PUSH_ITEMS {
            warn!(count, "oversized ACL push refused");
            handle.send(codec::make_close(close_code::PROTOCOL_ERROR));
            return Err(CodecError::PayloadTooLarge(count as usize * ACL_ITEM_LEN).into());
        }

        let mut items = Vec::with_capacity(count.min(4096) as usize);
        let mut item_buf = [0u8; ACL_ITEM_LEN];
        for _ in 0..count {
            self.recv_exact(reader, &mut item_buf).await?;
            items.push(AclItem::decode(&item_buf)?);
        }
        if let Err(e) = self.router.replace_acl(items) {
            warn!(error = %e, "ACL push rejected");
        }
        Ok(())
    }

    async fn handle_request(
        &self,
        reader: &mut ReadHalf<BoxedIo>,
        handle: &Arc<SessionHandle>,
        dest: Option<Uid>,
    ) -> Result<(), SessionError> {
        let mut header_buf = [0u8; RequestHeader::LEN];
        self.recv_exact(reader, &mut header_buf).await?;
        let header = RequestHeader::decode(&header_buf)?;
        let data = self.recv_payload(reader, header.payload.len).await?;

        let from = (!handle.is_central()).then(|| handle.uid);

        // Register before routing so an immediate response cannot race the
        // pending entry; roll back if routing fails.
        let expires_at = Instant::now() + self.config.request_timeout;
        let err_code = if !handle.begin_tracking(header.tracking, dest, expires_at) {
            Some(response_code::DUPLICATE_TRACKING)
        } else if self
            .router
            .route_request(
                from.as_ref(),
                dest.as_ref(),
                header.tracking,
                header.payload.format,
                header.payload.format_opt,
                &data,
            )
            .is_err()
        {
            handle.end_tracking(header.tracking);
            Some(response_code::NO_DESTINATION)
        } else {
            None
        };

        if let Some(code) = err_code {
            handle.send(codec::make_response_error(dest.as_ref(), header.tracking, code));
        }
        Ok(())
    }

    async fn handle_response(
        &self,
        reader: &mut ReadHalf<BoxedIo>,
        handle: &Arc<SessionHandle>,
        dest: Option<Uid>,
    ) -> Result<(), SessionError> {
        let mut header_buf = [0u8; ResponseHeader::LEN];
        self.recv_exact(reader, &mut header_buf).await?;
        let header = ResponseHeader::decode(&header_buf)?;
        let data = self.recv_payload(reader, header.payload.len).await?;

        let from = (!handle.is_central()).then(|| handle.uid);

        // The router ends the destination's wait on delivery.
        if let Err(e) = self.router.route_response(
            from.as_ref(),
            dest.as_ref(),
            header.tracking,
            header.code,
            header.payload.format,
            header.payload.format_opt,
            &data,
        ) {
            debug!(uid = %handle.uid, tracking = header.tracking, error = %e, "response dropped");
        }
        Ok(())
    }

    async fn recv_payload(
        &self,
        reader: &mut ReadHalf<BoxedIo>,
        len: u16,
    ) -> Result<Vec<u8>, SessionError> {
        let mut data = vec![0u8; usize::from(len)];
        if len > 0 {
            self.recv_exact(reader, &mut data).await?;
        }
        Ok(data)
    }

    async fn recv_exact<R>(&self, reader: &mut R, buf: &mut [u8]) -> Result<(), SessionError>
    where
        R: AsyncReadExt + Unpin,
    {
        match tokio::time::timeout(self.config.recv_timeout, reader.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(SessionError::Io(e)),
            Err(_) => Err(SessionError::RecvTimeout),
        }
    }
}

fn spawn_writer(
    cancel: CancellationToken,
    mut writer: WriteHalf<BoxedIo>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if writer.write_all(&frame).await.is_err() {
                            cancel.cancel();
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = writer.shutdown().await;
    })
}
