//! Broker core: sessions, routing state and access control.
//!
//! [`router::Router`] owns every shared table (live sessions, the ACL,
//! retained frames, telemetry tokens, HTTP bridge correlations) behind a
//! single mutex. [`session::Session`] drives one connection through
//! initiation, authentication and the framed data loop, talking to the
//! router for everything that crosses connections.

pub mod acl;
pub mod router;
pub mod session;
pub mod webhook;

pub use router::{AuthError, BridgeReply, GroupOptions, RouteError, Router, RouterConfig, WebhookSet};
pub use session::{Session, SessionConfig, SessionError, SessionHandle};
pub use webhook::{Webhook, WebhookReply};
