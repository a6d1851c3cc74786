use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::engine::service::BotService;

/// Shared state handed to every handler.
pub struct AppState {
    pub service: Arc<BotService>,
    /// Cancelled on shutdown; open event streams end with it.
    pub shutdown: CancellationToken,
}
