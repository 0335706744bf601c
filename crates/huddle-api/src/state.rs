use std::sync::Arc;

use huddle_db::Database;
use huddle_gateway::Gateway;
use huddle_gateway::delivery::DeliveryCoordinator;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub delivery: DeliveryCoordinator,
    pub jwt_secret: String,
    /// Push on create instead of waiting for the client's socket `new message`
    pub server_push: bool,
}

impl AppStateInner {
    /// Share the gateway's store and coordinator with the HTTP side.
    pub fn new(gateway: &Gateway) -> AppState {
        Arc::new(Self {
            db: gateway.db.clone(),
            delivery: gateway.delivery.clone(),
            jwt_secret: gateway.config.jwt_secret.clone(),
            server_push: gateway.config.server_push,
        })
    }
}
