use std::sync::Arc;

use crate::db::store::SqliteMessageStore;
use crate::engine::hub::HubHandle;
use crate::engine::session::SessionSettings;

use super::identity::IdentityProvider;

/// Shared state handed to every HTTP and WebSocket handler.
pub struct AppState {
    pub hub: HubHandle,
    pub store: Arc<SqliteMessageStore>,
    pub session: SessionSettings,
    pub identity: Arc<dyn IdentityProvider>,
    /// Public origin, used to scope CORS.
    pub public_url: String,
}
