use serde::{Deserialize, Serialize};

/// Token counters extracted from one streamed response. Ephemeral: folded
/// into account/api-key counters and into a `LogRecord`, never stored as-is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
}

impl TokenUsage {
    /// True when nothing was extracted from the stream.
    pub fn is_empty(&self) -> bool {
        *self == TokenUsage::default()
    }
}
