use serde::{Deserialize, Serialize};

/// A caller-facing credential bound to a user. Resolved by the auth
/// middleware before the forwarder runs; the forwarder only folds usage into
/// its counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: i64,
    pub user_id: i64,
    pub key: String,
    pub active: bool,
}
