pub mod config;
pub mod coordinator;
pub mod github;
pub mod ingest;
pub mod notify;
pub mod retry;
pub mod slack;
pub mod status;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use tokio::sync::watch;

pub use slacker_core::get_bot_version;
pub use store::StateStore;

use crate::ingest::IngestorState;

/// Shared state for the HTTP handlers.
pub struct AppState {
    pub store: Arc<StateStore>,
    pub ingestor: watch::Receiver<IngestorState>,
}
