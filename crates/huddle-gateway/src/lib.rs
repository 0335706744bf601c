pub mod delivery;
pub mod presence;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use huddle_db::Database;

use crate::delivery::DeliveryCoordinator;
use crate::presence::PresenceRegistry;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// HS256 secret shared with the auth service
    pub jwt_secret: String,
    pub ping_interval: Duration,
    /// Close the connection when no pong arrives within this window
    pub ping_timeout: Duration,
    /// The HTTP create path already pushed; ignore socket `new message`
    pub server_push: bool,
}

/// Everything a socket session needs, built once at startup and cloned into
/// each connection.
#[derive(Clone)]
pub struct Gateway {
    pub db: Arc<Database>,
    pub presence: PresenceRegistry,
    pub delivery: DeliveryCoordinator,
    pub config: Arc<GatewayConfig>,
}

impl Gateway {
    pub fn new(db: Arc<Database>, config: GatewayConfig) -> Self {
        let presence = PresenceRegistry::new();
        let delivery = DeliveryCoordinator::new(db.clone(), presence.clone());
        Self {
            db,
            presence,
            delivery,
            config: Arc::new(config),
        }
    }
}
