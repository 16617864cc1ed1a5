use std::sync::Arc;

use crate::config::Config;
use crate::store::Store;

pub mod body;
pub mod client;
pub mod forwarder;
pub mod headers;
pub mod probe;
pub mod refresh;
pub mod reporter;
pub mod state;
pub mod stream;
pub mod tee;

pub use forwarder::forward;
pub use reporter::{Reporter, ReporterHandle};

/// Everything a relay needs, assembled at startup and cloned per request.
#[derive(Clone)]
pub struct RelayState {
    pub store: Arc<dyn Store>,
    pub reporter: ReporterHandle,
    pub refresher: Arc<dyn refresh::CredentialRefresher>,
    pub config: Config,
}
