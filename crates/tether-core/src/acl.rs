//! ACL table parsing and persistence.
//!
//! The persisted store is a JSON object keyed by device UID, each value
//! carrying the group name and the 16-byte auth key in hex:
//!
//! ```json
//! { "ObjTest": { "GroupName": "sensors", "AuthKey": "43434343..." } }
//! ```
//!
//! Parsing is validate-before-commit: any invalid entry rejects the whole
//! store and leaves the in-memory table untouched.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tether_protocol::{AuthKey, GroupId, Uid};
use thiserror::Error;
use tracing::warn;

/// One resolved ACL entry: the group a device belongs to and its auth key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclAccess {
    pub group: GroupId,
    pub key: AuthKey,
}

/// ACL store failures.
#[derive(Debug, Error)]
pub enum AclError {
    /// Store file could not be read or written.
    #[error("ACL store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Store content is not the expected JSON shape.
    #[error("malformed ACL store: {0}")]
    Parse(String),

    /// A device UID is not a valid identity name.
    #[error("invalid device UID: {0}")]
    BadUid(String),

    /// An entry references a group that is not configured.
    #[error("unknown group: {0}")]
    UnknownGroup(String),

    /// An auth key is not exactly 16 hex-encoded bytes.
    #[error("invalid auth key for {0}")]
    BadKey(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredAccess {
    #[serde(rename = "GroupName")]
    group_name: String,
    #[serde(rename = "AuthKey")]
    auth_key: String,
}

/// Parse and validate a persisted ACL store.
///
/// Every entry must name a configured group and carry a 16-byte hex key;
/// the first failure rejects the whole store.
///
/// # Errors
///
/// Returns an error describing the first invalid entry.
pub fn parse_store<G>(
    json: &str,
    group_exists: G,
) -> Result<HashMap<Uid, AclAccess>, AclError>
where
    G: Fn(&GroupId) -> bool,
{
    let stored: HashMap<String, StoredAccess> =
        serde_json::from_str(json).map_err(|e| AclError::Parse(e.to_string()))?;

    let mut acl = HashMap::with_capacity(stored.len());
    for (name, access) in stored {
        let uid = Uid::from_name(&name).map_err(|_| AclError::BadUid(name.clone()))?;
        let group = GroupId::from_name(&access.group_name)
            .map_err(|_| AclError::UnknownGroup(access.group_name.clone()))?;
        if !group_exists(&group) {
            return Err(AclError::UnknownGroup(access.group_name));
        }
        let key = decode_key(&access.auth_key).ok_or_else(|| AclError::BadKey(name.clone()))?;
        acl.insert(uid, AclAccess { group, key });
    }
    Ok(acl)
}

/// Render an ACL table into its persisted JSON form.
///
/// Entries whose identities do not decode to UTF-8 names cannot be stored
/// and are skipped with a warning.
#[must_use]
pub fn render_store(acl: &HashMap<Uid, AclAccess>) -> String {
    let mut stored = HashMap::with_capacity(acl.len());
    for (uid, access) in acl {
        let (Ok(name), Ok(group_name)) = (uid.name(), access.group.name()) else {
            warn!(%uid, "skipping ACL entry with undecodable identity");
            continue;
        };
        stored.insert(
            name,
            StoredAccess {
                group_name,
                auth_key: hex::encode(access.key),
            },
        );
    }
    // A map of plain strings always serializes.
    serde_json::to_string(&stored).unwrap_or_else(|_| "{}".to_owned())
}

/// Decode a 16-byte hex auth key.
#[must_use]
pub fn decode_key(hex_key: &str) -> Option<AuthKey> {
    let bytes = hex::decode(hex_key).ok()?;
    bytes.try_into().ok()
}
