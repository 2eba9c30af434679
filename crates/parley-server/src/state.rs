//! Shared application state handed to every handler.

use std::sync::Arc;

use tokio::sync::Mutex;

use parley_store::Database;

use crate::auth::CredentialCheck;
use crate::config::Config;
use crate::media_store::MediaStore;
use crate::notify::NotificationDispatcher;
use crate::rate_limit::{IpRateLimiter, KeyedLimiter};
use crate::registry::SessionRegistry;
use crate::router::MessageRouter;

/// The durable store behind one async mutex. Every persistence touch is a
/// single atomic section with respect to other connections.
pub type SharedDb = Arc<Mutex<Database>>;

#[derive(Clone)]
pub struct AppState {
    pub db: SharedDb,
    pub registry: SessionRegistry,
    pub router: Arc<MessageRouter>,
    pub credentials: Arc<CredentialCheck>,
    pub media_store: Arc<MediaStore>,
    pub rate_limiter: IpRateLimiter,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wire up every subsystem around an opened database and media store.
    pub fn new(db: Database, media_store: MediaStore, config: Config) -> Self {
        let db: SharedDb = Arc::new(Mutex::new(db));
        let registry = SessionRegistry::new();
        let notifier = NotificationDispatcher::new(db.clone(), registry.clone());
        let router = Arc::new(MessageRouter::new(db.clone(), registry.clone(), notifier));

        Self {
            credentials: Arc::new(CredentialCheck::new(db.clone())),
            media_store: Arc::new(media_store),
            // 10 req/s sustained per client IP, burst of 30
            rate_limiter: KeyedLimiter::new(10.0, 30.0),
            config: Arc::new(config),
            db,
            registry,
            router,
        }
    }
}
