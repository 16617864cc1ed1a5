pub mod account;
pub mod api_key;
pub mod log;
pub mod usage;

pub use account::{Account, AccountStatus, Platform};
pub use api_key::ApiKey;
pub use log::LogRecord;
pub use usage::TokenUsage;
