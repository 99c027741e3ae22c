use crate::chat::typing::TypingTracker;
use crate::config::{ChatConfig, Config, ConnectionConfig, DispatchConfig};
use crate::db::DbPool;
use crate::presence::PresenceTracker;
use crate::ws::Hub;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// JWT signing secret (256-bit random key)
    pub jwt_secret: Vec<u8>,
    /// Live sockets and room membership
    pub hub: Hub,
    /// Online participants and the driver eligibility set
    pub presence: PresenceTracker,
    /// Ephemeral typing indicators per chat session
    pub typing: TypingTracker,
    pub dispatch: DispatchConfig,
    pub chat: ChatConfig,
    pub connection: ConnectionConfig,
}

impl AppState {
    pub fn new(db: DbPool, jwt_secret: Vec<u8>, config: &Config) -> Self {
        Self {
            db,
            jwt_secret,
            hub: crate::ws::Hub::new(),
            presence: PresenceTracker::new(),
            typing: TypingTracker::new(config.chat.typing_timeout()),
            dispatch: config.dispatch.clone(),
            chat: config.chat.clone(),
            connection: config.connection.clone(),
        }
    }
}
