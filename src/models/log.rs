use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TokenUsage;

/// Immutable record of one completed relay. Written by the reporter worker
/// for successful usage-bearing relays; bulk-deleted by the retention sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    /// Request start to usage-extraction complete, in milliseconds.
    pub duration_ms: i64,
    pub user_id: i64,
    pub api_key_id: i64,
    pub account_id: i64,
    pub usage: TokenUsage,
    pub success: bool,
}
