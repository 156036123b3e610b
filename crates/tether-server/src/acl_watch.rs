//! ACL store file watcher.
//!
//! Polls the store's modification time once a second and reloads the
//! table when an outside edit lands. Writes made by the broker itself move
//! the mtime too; the reload they trigger is a no-op.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tether_core::Router;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn mtime(path: &PathBuf) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Watch the ACL store until cancelled.
pub fn spawn_acl_watcher(
    path: PathBuf,
    router: Arc<Router>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = mtime(&path);
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let current = mtime(&path);
            if current == last {
                continue;
            }
            last = current;
            debug!(path = %path.display(), "ACL store changed on disk");
            match router.load_acl() {
                Ok(()) => info!(path = %path.display(), "ACL reloaded"),
                Err(e) => warn!(path = %path.display(), error = %e, "ACL reload failed"),
            }
        }
    })
}
