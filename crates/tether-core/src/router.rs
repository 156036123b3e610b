//! Central routing state: live sessions, the ACL, retained frames for
//! sleeping objects, telemetry tokens and HTTP bridge correlations.
//!
//! All tables live behind one mutex and every critical section is a
//! handful of map operations plus queue pushes. Anything that can block
//! (webhook calls, ACL persistence) happens outside the lock.

use crate::acl::{self, AclAccess, AclError};
use crate::session::SessionHandle;
use crate::webhook::{Webhook, WebhookReply};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_protocol::codec::{self, response_code, AclItem, CodecError};
use tether_protocol::payload::{PayloadValue, FORMAT_OPT_NONE};
use tether_protocol::{token_to_hex, AuthKey, GroupId, TelemetryToken, Uid};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Routing failures reported back to the sender.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// No live session, retained slot or fallback could take the frame.
    #[error("no destination")]
    NoDestination,

    /// The telemetry token is unknown or expired.
    #[error("unknown telemetry token")]
    UnknownToken,

    /// The frame could not be encoded for delivery.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Challenge verification failures.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The identity has no ACL entry.
    #[error("unknown identity")]
    UnknownIdentity,

    /// The HMAC digest did not match.
    #[error("invalid digest")]
    BadDigest,
}

/// Per-group behaviour, set from configuration.
#[derive(Debug, Clone, Copy, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupOptions {
    /// Issue a telemetry token to members at authentication.
    #[serde(default)]
    pub telemetry: bool,
    /// Token lifetime in minutes; `None` means no expiry.
    #[serde(default)]
    pub telemetry_token_exp_min: Option<u32>,
}

/// Router construction parameters.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Path the ACL store is loaded from and persisted to.
    pub acl_path: PathBuf,
    /// Shared secret of the central authority.
    pub central_auth_key: AuthKey,
    /// How long a departed session's slot retains inbound requests.
    pub keep_session: Duration,
}

/// Reply delivered to a waiting HTTP bridge request.
#[derive(Debug)]
pub struct BridgeReply {
    pub code: u8,
    /// Decoded payload; `None` for synthetic timeout replies.
    pub value: Option<PayloadValue>,
}

struct RetainedSlot {
    frames: Vec<Bytes>,
    expires_at: Instant,
}

struct Correlation {
    reply: oneshot::Sender<BridgeReply>,
    expires_at: Option<Instant>,
}

struct TokenEntry {
    uid: Uid,
    expires_at: Option<Instant>,
}

struct RouterState {
    acl: HashMap<Uid, AclAccess>,
    central: Option<Arc<SessionHandle>>,
    objects: HashMap<Uid, Arc<SessionHandle>>,
    retained: HashMap<Uid, RetainedSlot>,
    correlations: HashMap<u16, Correlation>,
    telemetry_tokens: HashMap<TelemetryToken, TokenEntry>,
}

impl RouterState {
    /// The central authority counts as reachable while a retained slot is
    /// holding frames for it.
    fn central_exists(&self) -> bool {
        self.central.is_some() || self.retained.contains_key(&Uid::CENTRAL)
    }
}

/// Webhook fallbacks used while no central session exists.
#[derive(Default, Clone)]
pub struct WebhookSet {
    /// Target for object requests.
    pub request: Option<Arc<dyn Webhook>>,
    /// Target for telemetry data.
    pub telemetry: Option<Arc<dyn Webhook>>,
}

/// The broker's routing core.
pub struct Router {
    config: RouterConfig,
    groups: HashMap<GroupId, GroupOptions>,
    webhooks: WebhookSet,
    state: Mutex<RouterState>,
}

impl Router {
    #[must_use]
    pub fn new(
        config: RouterConfig,
        groups: HashMap<GroupId, GroupOptions>,
        webhooks: WebhookSet,
    ) -> Self {
        Self {
            config,
            groups,
            webhooks,
            state: Mutex::new(RouterState {
                acl: HashMap::new(),
                central: None,
                objects: HashMap::new(),
                retained: HashMap::new(),
                correlations: HashMap::new(),
                telemetry_tokens: HashMap::new(),
            }),
        }
    }

    /// Compare a presented key against the central secret.
    #[must_use]
    pub fn check_central_key(&self, key: &[u8]) -> bool {
        key == self.config.central_auth_key
    }

    /// Verify a challenge reply and register the session.
    ///
    /// On success the auth validation, any retained frames and a fresh
    /// telemetry token (when the group grants one) are queued on the
    /// session, in that order. A previous session under the same identity
    /// is preempted.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown identities or digest mismatches; the
    /// session is not registered in that case.
    pub fn authenticate(
        &self,
        handle: &Arc<SessionHandle>,
        nonce: &[u8],
        digest: &[u8; 32],
    ) -> Result<(), AuthError> {
        let uid = handle.uid();
        let mut st = self.state.lock();

        let (key, group) = if uid.is_central() {
            (self.config.central_auth_key, None)
        } else {
            let access = st.acl.get(&uid).ok_or(AuthError::UnknownIdentity)?;
            (access.key, Some(access.group))
        };

        let mut mac = HmacSha256::new_from_slice(&key).map_err(|_| AuthError::BadDigest)?;
        mac.update(nonce);
        mac.verify_slice(digest).map_err(|_| AuthError::BadDigest)?;

        let previous = if uid.is_central() {
            st.central.replace(Arc::clone(handle))
        } else {
            st.objects.insert(uid, Arc::clone(handle))
        };
        if let Some(previous) = previous {
            debug!(%uid, "preempting previous session");
            previous.close();
        }

        handle.send(Bytes::copy_from_slice(&codec::make_auth_validation(true)));
        if let Some(slot) = st.retained.remove(&uid) {
            debug!(%uid, frames = slot.frames.len(), "flushing retained frames");
            for frame in slot.frames {
                handle.send(frame);
            }
        }

        let options = group.and_then(|g| self.groups.get(&g));
        if let Some(options) = options.filter(|o| o.telemetry) {
            let token = new_token(&st.telemetry_tokens);
            // Zero or absent minutes means the token never expires.
            let expires_at = options
                .telemetry_token_exp_min
                .filter(|&min| min > 0)
                .map(|min| Instant::now() + Duration::from_secs(u64::from(min) * 60));
            st.telemetry_tokens.insert(token, TokenEntry { uid, expires_at });
            handle.send(codec::make_telemetry_token(&token));
            info!(
                %uid,
                token = %token_to_hex(&token),
                exp_min = ?options.telemetry_token_exp_min,
                "telemetry token issued"
            );
        }

        info!(%uid, central = uid.is_central(), "session authenticated");
        Ok(())
    }

    /// Deregister a session at teardown.
    ///
    /// Only the currently registered handle can vacate its slot, so a
    /// preempted session cannot disturb its successor. When the peer
    /// announced intent to return, a retained slot is opened; otherwise
    /// the identity's telemetry tokens are revoked.
    pub fn remove_session(&self, handle: &Arc<SessionHandle>, keep: bool) {
        let uid = handle.uid();
        let mut st = self.state.lock();

        let removed = if handle.is_central() {
            match &st.central {
                Some(current) if current.id() == handle.id() => {
                    st.central = None;
                    true
                }
                _ => false,
            }
        } else {
            match st.objects.get(&uid) {
                Some(current) if current.id() == handle.id() => {
                    st.objects.remove(&uid);
                    true
                }
                _ => false,
            }
        };

        if !removed {
            return;
        }
        if keep {
            st.retained.insert(
                uid,
                RetainedSlot {
                    frames: Vec::new(),
                    expires_at: Instant::now() + self.config.keep_session,
                },
            );
            debug!(%uid, "session slot retained");
        } else if !handle.is_central() {
            st.telemetry_tokens.retain(|_, entry| entry.uid != uid);
        }
    }

    /// Route a request toward `dest` (`None` for central).
    ///
    /// Delivery order: live session, then retained slot, then (for the
    /// central destination only) the webhook fallback.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::NoDestination`] when nothing can take the
    /// frame; the caller answers the sender with an error response.
    pub fn route_request(
        self: &Arc<Self>,
        from: Option<&Uid>,
        dest: Option<&Uid>,
        tracking: u16,
        format: u8,
        format_opt: u8,
        data: &[u8],
    ) -> Result<(), RouteError> {
        {
            let mut st = self.state.lock();
            if dest.is_some() || st.central_exists() {
                let frame = codec::make_request(from, tracking, format, format_opt, data)?;
                let target = match dest {
                    Some(uid) => st.objects.get(uid).cloned(),
                    None => st.central.clone(),
                };
                if let Some(session) = target {
                    if session.send(frame.clone()) {
                        return Ok(());
                    }
                }
                let slot_uid = dest.copied().unwrap_or(Uid::CENTRAL);
                return match st.retained.get_mut(&slot_uid) {
                    Some(slot) => {
                        slot.frames.push(frame);
                        debug!(tracking, uid = %slot_uid, "request retained");
                        Ok(())
                    }
                    None => Err(RouteError::NoDestination),
                };
            }
            if self.webhooks.request.is_none() {
                return Err(RouteError::NoDestination);
            }
        }

        // No central anywhere: fall back to the webhook, object senders only.
        let from = *from.ok_or(RouteError::NoDestination)?;
        let value = PayloadValue::decode(format, data)?;
        self.spawn_webhook_request(from, tracking, value);
        Ok(())
    }

    fn spawn_webhook_request(self: &Arc<Self>, from: Uid, tracking: u16, value: PayloadValue) {
        let Some(webhook) = self.webhooks.request.clone() else {
            return;
        };
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let reply = webhook.post(&from, &value).await;
            router.finish_webhook_request(&from, tracking, reply);
        });
    }

    /// Turn a webhook result into the response the waiting object sees.
    fn finish_webhook_request(&self, uid: &Uid, tracking: u16, reply: Option<WebhookReply>) {
        let session = self.state.lock().objects.get(uid).cloned();
        let Some(session) = session else {
            debug!(%uid, tracking, "webhook reply for departed session");
            return;
        };
        session.end_tracking(tracking);
        let frame = reply
            .and_then(|reply| {
                let data = reply.value.encode().ok()?;
                codec::make_response(
                    None,
                    tracking,
                    reply.code,
                    reply.value.format() as u8,
                    FORMAT_OPT_NONE,
                    &data,
                )
                .ok()
            })
            .unwrap_or_else(|| codec::make_response_error(None, tracking, response_code::REJECTED));
        session.send(frame);
    }

    /// Route a response toward `dest` (`None` for central).
    ///
    /// With no central session the response is matched against a waiting
    /// HTTP bridge correlation instead. Responses are never retained.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::NoDestination`] when no session or
    /// correlation is waiting for it.
    pub fn route_response(
        &self,
        from: Option<&Uid>,
        dest: Option<&Uid>,
        tracking: u16,
        code: u8,
        format: u8,
        format_opt: u8,
        data: &[u8],
    ) -> Result<(), RouteError> {
        let reply = {
            let mut st = self.state.lock();
            if dest.is_some() || st.central_exists() {
                let target = match dest {
                    Some(uid) => st.objects.get(uid).cloned(),
                    None => st.central.clone(),
                };
                let Some(session) = target else {
                    return Err(RouteError::NoDestination);
                };
                session.end_tracking(tracking);
                let frame = codec::make_response(from, tracking, code, format, format_opt, data)?;
                if session.send(frame) {
                    return Ok(());
                }
                return Err(RouteError::NoDestination);
            }
            let value = PayloadValue::decode(format, data)?;
            match st.correlations.remove(&tracking) {
                Some(corr) => (corr.reply, BridgeReply { code, value: Some(value) }),
                None => return Err(RouteError::NoDestination),
            }
        };
        let (sender, bridge_reply) = reply;
        // Receiver side may have hung up; nothing left to notify then.
        let _ = sender.send(bridge_reply);
        Ok(())
    }

    /// Route a UDP telemetry datagram by its token.
    ///
    /// Delivered to the central session when one is live, to the webhook
    /// fallback when none exists at all, and dropped while the central
    /// slot is merely retained.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown tokens or when no destination takes
    /// the data. The datagram is never answered either way.
    pub fn route_telemetry(
        self: &Arc<Self>,
        token: &TelemetryToken,
        format: u8,
        format_opt: u8,
        data: &[u8],
    ) -> Result<(), RouteError> {
        let uid = {
            let st = self.state.lock();
            let entry = st.telemetry_tokens.get(token).ok_or(RouteError::UnknownToken)?;
            let uid = entry.uid;
            debug!(%uid, token = %token_to_hex(token), "telemetry received");

            if st.central_exists() {
                if let Some(central) = &st.central {
                    let frame = codec::make_ident_telemetry(&uid, format, format_opt, data)?;
                    if central.send(frame) {
                        return Ok(());
                    }
                }
                return Err(RouteError::NoDestination);
            }
            if self.webhooks.telemetry.is_none() {
                return Err(RouteError::NoDestination);
            }
            uid
        };

        let value = PayloadValue::decode(format, data)?;
        if let Some(webhook) = self.webhooks.telemetry.clone() {
            tokio::spawn(async move {
                webhook.post(&uid, &value).await;
            });
        }
        Ok(())
    }

    /// Register an HTTP bridge request waiting for a routed response.
    /// Returns the tracking number assigned to it.
    pub fn add_correlation(
        &self,
        reply: oneshot::Sender<BridgeReply>,
        timeout: Option<Duration>,
    ) -> u16 {
        let mut st = self.state.lock();
        let mut tracking = rand::random::<u16>();
        while st.correlations.contains_key(&tracking) {
            tracking = rand::random();
        }
        st.correlations.insert(
            tracking,
            Correlation {
                reply,
                expires_at: timeout.map(|t| Instant::now() + t),
            },
        );
        tracking
    }

    /// Withdraw a bridge correlation (the HTTP client went away).
    pub fn remove_correlation(&self, tracking: u16) {
        self.state.lock().correlations.remove(&tracking);
    }

    /// Replace the whole ACL with a pushed store and persist it.
    ///
    /// The swap is all-or-nothing: one item naming an unknown group
    /// rejects the entire push and leaves the current ACL in place.
    ///
    /// # Errors
    ///
    /// Returns an error naming the offending group.
    pub fn replace_acl(&self, items: Vec<AclItem>) -> Result<(), AclError> {
        let mut acl = HashMap::with_capacity(items.len());
        for item in items {
            if !self.groups.contains_key(&item.group) {
                return Err(AclError::UnknownGroup(item.group.name().unwrap_or_default()));
            }
            acl.insert(item.uid, AclAccess { group: item.group, key: item.key });
        }
        let count = acl.len();
        self.state.lock().acl = acl;
        info!(count, "ACL replaced");
        self.save_acl();
        Ok(())
    }

    /// Load the ACL store from disk, replacing the in-memory table.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or fails validation;
    /// the current table is kept in that case.
    pub fn load_acl(&self) -> Result<(), AclError> {
        let json = std::fs::read_to_string(&self.config.acl_path)?;
        let acl = acl::parse_store(&json, |group| self.groups.contains_key(group))?;
        let count = acl.len();
        self.state.lock().acl = acl;
        info!(count, path = %self.config.acl_path.display(), "ACL loaded");
        Ok(())
    }

    /// Persist the current ACL. Failures are logged, never fatal.
    pub fn save_acl(&self) {
        let rendered = {
            let st = self.state.lock();
            acl::render_store(&st.acl)
        };
        if let Err(e) = std::fs::write(&self.config.acl_path, rendered) {
            warn!(path = %self.config.acl_path.display(), error = %e, "ACL persist failed");
        }
    }

    /// One housekeeping pass: expire retained slots, telemetry tokens,
    /// bridge correlations and per-session pending requests.
    pub fn sweep(&self, now: Instant) {
        let (expired_replies, sessions) = {
            let mut st = self.state.lock();
            st.retained.retain(|uid, slot| {
                let live = now < slot.expires_at;
                if !live {
                    debug!(%uid, "retained slot expired");
                }
                live
            });
            st.telemetry_tokens.retain(|token, entry| {
                let live = entry.expires_at.map_or(true, |exp| now < exp);
                if !live {
                    info!(token = %token_to_hex(token), uid = %entry.uid, "telemetry token expired");
                }
                live
            });

            let dead: Vec<u16> = st
                .correlations
                .iter()
                .filter(|(_, c)| c.expires_at.map_or(false, |exp| now >= exp))
                .map(|(&n, _)| n)
                .collect();
            let expired: Vec<(u16, Correlation)> = dead
                .into_iter()
                .filter_map(|n| st.correlations.remove(&n).map(|c| (n, c)))
                .collect();

            let mut sessions: Vec<Arc<SessionHandle>> = st.objects.values().cloned().collect();
            if let Some(central) = &st.central {
                sessions.push(Arc::clone(central));
            }
            (expired, sessions)
        };

        for (tracking, corr) in expired_replies {
            info!(tracking, "bridge request timed out");
            let _ = corr.reply.send(BridgeReply {
                code: response_code::TIMEOUT,
                value: None,
            });
        }
        for session in sessions {
            session.sweep_pending(now);
        }
    }

    /// Run [`sweep`](Self::sweep) once a second until cancelled.
    pub fn start_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => router.sweep(Instant::now()),
                }
            }
        })
    }

    /// Close every live session for broker shutdown.
    pub fn shutdown(&self, close_frame: Bytes) {
        let sessions = {
            let st = self.state.lock();
            let mut sessions: Vec<Arc<SessionHandle>> = st.objects.values().cloned().collect();
            if let Some(central) = &st.central {
                sessions.push(Arc::clone(central));
            }
            sessions
        };
        for session in sessions {
            session.send(close_frame.clone());
            session.close();
        }
    }
}

fn new_token(existing: &HashMap<TelemetryToken, TokenEntry>) -> TelemetryToken {
    let mut token = [0u8; 8];
    loop {
        rand::thread_rng().fill_bytes(&mut token);
        if !existing.contains_key(&token) {
            return token;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KEY: AuthKey = [0x11; 16];

    fn test_router(dir: &TempDir) -> Arc<Router> {
        test_router_with(dir, WebhookSet::default())
    }

    fn test_router_with(dir: &TempDir, webhooks: WebhookSet) -> Arc<Router> {
        let mut groups = HashMap::new();
        groups.insert(
            GroupId::from_name("sensors").unwrap(),
            GroupOptions { telemetry: true, telemetry_token_exp_min: Some(5) },
        );
        Arc::new(Router::new(
            RouterConfig {
                acl_path: dir.path().join("acl.json"),
                central_auth_key: KEY,
                keep_session: Duration::from_secs(60),
            },
            groups,
            webhooks,
        ))
    }

    /// Webhook double: records every post and answers with a fixed reply.
    struct ScriptedWebhook {
        reply: Option<WebhookReply>,
        posts: tokio::sync::mpsc::UnboundedSender<(Uid, PayloadValue)>,
    }

    #[async_trait::async_trait]
    impl Webhook for ScriptedWebhook {
        async fn post(&self, uid: &Uid, value: &PayloadValue) -> Option<WebhookReply> {
            let _ = self.posts.send((*uid, value.clone()));
            self.reply.clone()
        }
    }

    fn digest(key: &AuthKey, nonce: &[u8]) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(key).unwrap();
        mac.update(nonce);
        mac.finalize().into_bytes().into()
    }

    fn grant(router: &Router, uid: Uid) {
        router
            .replace_acl(vec![AclItem {
                group: GroupId::from_name("sensors").unwrap(),
                uid,
                key: KEY,
            }])
            .unwrap();
    }

    #[tokio::test]
    async fn authenticate_rejects_bad_digest() {
        let dir = TempDir::new().unwrap();
        let router = test_router(&dir);
        let uid = Uid::from_name("dev1").unwrap();
        grant(&router, uid);

        let (handle, _rx) = SessionHandle::new(uid);
        let err = router.authenticate(&handle, &[0u8; 16], &[0u8; 32]).unwrap_err();
        assert!(matches!(err, AuthError::BadDigest));

        let unknown = Uid::from_name("ghost").unwrap();
        let (handle, _rx) = SessionHandle::new(unknown);
        let err = router.authenticate(&handle, &[0u8; 16], &[0u8; 32]).unwrap_err();
        assert!(matches!(err, AuthError::UnknownIdentity));
    }

    #[tokio::test]
    async fn authenticate_queues_validation_and_token() {
        let dir = TempDir::new().unwrap();
        let router = test_router(&dir);
        let uid = Uid::from_name("dev1").unwrap();
        grant(&router, uid);

        let (handle, mut rx) = SessionHandle::new(uid);
        let nonce = [7u8; 16];
        router.authenticate(&handle, &nonce, &digest(&KEY, &nonce)).unwrap();

        assert_eq!(rx.recv().await.unwrap().as_ref(), &[0x01]);
        let token_frame = rx.recv().await.unwrap();
        assert_eq!(token_frame.len(), 9);
    }

    #[tokio::test]
    async fn preemption_closes_previous_session() {
        let dir = TempDir::new().unwrap();
        let router = test_router(&dir);
        let uid = Uid::from_name("dev1").unwrap();
        grant(&router, uid);
        let nonce = [7u8; 16];
        let d = digest(&KEY, &nonce);

        let (first, _rx1) = SessionHandle::new(uid);
        router.authenticate(&first, &nonce, &d).unwrap();
        let (second, _rx2) = SessionHandle::new(uid);
        router.authenticate(&second, &nonce, &d).unwrap();
        assert!(!first.send(Bytes::from_static(b"x")));

        // The preempted session must not vacate its successor's slot or
        // open a retained window.
        router.remove_session(&first, true);
        router.route_request(None, Some(&uid), 1, 0x00, 0x00, b"hi").unwrap();
    }

    #[tokio::test]
    async fn retained_requests_flush_in_order_on_return() {
        let dir = TempDir::new().unwrap();
        let router = test_router(&dir);
        let uid = Uid::from_name("dev1").unwrap();
        grant(&router, uid);
        let nonce = [7u8; 16];
        let d = digest(&KEY, &nonce);

        let (first, _rx1) = SessionHandle::new(uid);
        router.authenticate(&first, &nonce, &d).unwrap();
        router.remove_session(&first, true);

        router.route_request(None, Some(&uid), 1, 0x00, 0x00, b"a").unwrap();
        router.route_request(None, Some(&uid), 2, 0x00, 0x00, b"b").unwrap();

        let (second, mut rx) = SessionHandle::new(uid);
        router.authenticate(&second, &nonce, &d).unwrap();

        assert_eq!(rx.recv().await.unwrap().as_ref(), &[0x01]);
        let frame1 = rx.recv().await.unwrap();
        let frame2 = rx.recv().await.unwrap();
        assert_eq!(u16::from_be_bytes([frame1[1], frame1[2]]), 1);
        assert_eq!(u16::from_be_bytes([frame2[1], frame2[2]]), 2);
    }

    #[tokio::test]
    async fn route_to_absent_object_is_no_destination() {
        let dir = TempDir::new().unwrap();
        let router = test_router(&dir);
        let uid = Uid::from_name("dev1").unwrap();
        let err = router.route_request(None, Some(&uid), 1, 0x00, 0x00, b"x").unwrap_err();
        assert!(matches!(err, RouteError::NoDestination));
    }

    #[tokio::test]
    async fn telemetry_requires_known_token() {
        let dir = TempDir::new().unwrap();
        let router = test_router(&dir);
        let err = router.route_telemetry(&[0u8; 8], 0x00, 0x00, b"x").unwrap_err();
        assert!(matches!(err, RouteError::UnknownToken));
    }

    #[tokio::test]
    async fn bridge_correlation_times_out() {
        let dir = TempDir::new().unwrap();
        let router = test_router(&dir);
        let (tx, rx) = oneshot::channel();
        let tracking = router.add_correlation(tx, Some(Duration::from_millis(1)));

        router.sweep(Instant::now() + Duration::from_secs(1));
        let reply = rx.await.unwrap();
        assert_eq!(reply.code, response_code::TIMEOUT);
        assert!(reply.value.is_none());

        // The slot is free again.
        router.remove_correlation(tracking);
    }

    #[tokio::test]
    async fn webhook_reply_answers_the_waiting_object() {
        use tether_protocol::codec::ResponseHeader;

        let dir = TempDir::new().unwrap();
        let (posts_tx, mut posts_rx) = tokio::sync::mpsc::unbounded_channel();
        let router = test_router_with(
            &dir,
            WebhookSet {
                request: Some(Arc::new(ScriptedWebhook {
                    reply: Some(WebhookReply {
                        code: response_code::OK,
                        value: PayloadValue::Utf8("pong".into()),
                    }),
                    posts: posts_tx,
                })),
                telemetry: None,
            },
        );
        let uid = Uid::from_name("dev1").unwrap();
        grant(&router, uid);

        let (handle, mut rx) = SessionHandle::new(uid);
        let nonce = [7u8; 16];
        router.authenticate(&handle, &nonce, &digest(&KEY, &nonce)).unwrap();
        assert_eq!(rx.recv().await.unwrap().as_ref(), &[0x01]);
        let _token = rx.recv().await.unwrap();

        let far = Instant::now() + Duration::from_secs(30);
        assert!(handle.begin_tracking(5, None, far));
        router.route_request(Some(&uid), None, 5, 0x02, 0x00, b"ping").unwrap();

        // The decoded payload reaches the webhook tagged with the sender.
        let (posted_uid, posted) = posts_rx.recv().await.unwrap();
        assert_eq!(posted_uid, uid);
        assert_eq!(posted, PayloadValue::Utf8("ping".into()));

        let frame = rx.recv().await.unwrap();
        let header = ResponseHeader::decode(&frame[1..7]).unwrap();
        assert_eq!(header.tracking, 5);
        assert_eq!(header.code, response_code::OK);
        assert_eq!(&frame[7..], b"pong");

        // The reply ended the pending entry.
        assert!(handle.begin_tracking(5, None, far));
    }

    #[tokio::test]
    async fn failed_webhook_rejects_the_request() {
        use tether_protocol::codec::ResponseHeader;

        let dir = TempDir::new().unwrap();
        let (posts_tx, _posts_rx) = tokio::sync::mpsc::unbounded_channel();
        let router = test_router_with(
            &dir,
            WebhookSet {
                request: Some(Arc::new(ScriptedWebhook { reply: None, posts: posts_tx })),
                telemetry: None,
            },
        );
        let uid = Uid::from_name("dev1").unwrap();
        grant(&router, uid);

        let (handle, mut rx) = SessionHandle::new(uid);
        let nonce = [7u8; 16];
        router.authenticate(&handle, &nonce, &digest(&KEY, &nonce)).unwrap();
        assert_eq!(rx.recv().await.unwrap().as_ref(), &[0x01]);
        let _token = rx.recv().await.unwrap();

        router.route_request(Some(&uid), None, 9, 0x02, 0x00, b"ping").unwrap();

        let frame = rx.recv().await.unwrap();
        let header = ResponseHeader::decode(&frame[1..7]).unwrap();
        assert_eq!(header.tracking, 9);
        assert_eq!(header.code, response_code::REJECTED);
        assert_eq!(header.payload.len, 0);
    }

    #[tokio::test]
    async fn telemetry_uses_webhook_only_without_any_central() {
        let dir = TempDir::new().unwrap();
        let (posts_tx, mut posts_rx) = tokio::sync::mpsc::unbounded_channel();
        let router = test_router_with(
            &dir,
            WebhookSet {
                request: None,
                telemetry: Some(Arc::new(ScriptedWebhook { reply: None, posts: posts_tx })),
            },
        );
        let uid = Uid::from_name("dev1").unwrap();
        grant(&router, uid);

        let (handle, mut rx) = SessionHandle::new(uid);
        let nonce = [7u8; 16];
        router.authenticate(&handle, &nonce, &digest(&KEY, &nonce)).unwrap();
        assert_eq!(rx.recv().await.unwrap().as_ref(), &[0x01]);
        let token_frame = rx.recv().await.unwrap();
        let mut token = [0u8; 8];
        token.copy_from_slice(&token_frame[1..9]);

        // While the central slot is merely retained the datagram is dropped.
        let (central, _central_rx) = SessionHandle::new(Uid::CENTRAL);
        router.authenticate(&central, &nonce, &digest(&KEY, &nonce)).unwrap();
        router.remove_session(&central, true);
        let err = router.route_telemetry(&token, 0x02, 0x00, b"42").unwrap_err();
        assert!(matches!(err, RouteError::NoDestination));
        assert!(posts_rx.try_recv().is_err());

        // Once the retained window has expired the webhook takes over.
        router.sweep(Instant::now() + Duration::from_secs(120));
        router.route_telemetry(&token, 0x02, 0x00, b"42").unwrap();
        let (posted_uid, posted) = posts_rx.recv().await.unwrap();
        assert_eq!(posted_uid, uid);
        assert_eq!(posted, PayloadValue::Utf8("42".into()));
    }

    #[tokio::test]
    async fn acl_push_rejects_unknown_group_atomically() {
        let dir = TempDir::new().unwrap();
        let router = test_router(&dir);
        let uid = Uid::from_name("dev1").unwrap();
        grant(&router, uid);

        let err = router
            .replace_acl(vec![AclItem {
                group: GroupId::from_name("nope").unwrap(),
                uid,
                key: KEY,
            }])
            .unwrap_err();
        assert!(matches!(err, AclError::UnknownGroup(_)));

        // Previous table survived the failed push.
        let nonce = [7u8; 16];
        let (handle, _rx) = SessionHandle::new(uid);
        router.authenticate(&handle, &nonce, &digest(&KEY, &nonce)).unwrap();
    }

    #[tokio::test]
    async fn acl_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let router = test_router(&dir);
        let uid = Uid::from_name("dev1").unwrap();
        grant(&router, uid);

        let fresh = test_router(&dir);
        fresh.load_acl().unwrap();
        let nonce = [7u8; 16];
        let (handle, _rx) = SessionHandle::new(uid);
        fresh.authenticate(&handle, &nonce, &digest(&KEY, &nonce)).unwrap();
    }
}
