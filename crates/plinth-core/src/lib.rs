pub mod admission;
pub mod auth;
pub mod control;
pub mod egress;
pub mod error;
pub mod registry;
pub mod service;
pub mod session;
pub mod supervisor;
pub mod worker;

use std::sync::Arc;

pub use error::CoreError;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<service::StreamService>,
    pub config: AppConfig,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub jwt_secret: String,
    pub jwt_expiry_seconds: u64,
    /// Whether a renderer binary was found at startup. Starts still run
    /// their launch path without one (bridged deployments have no binary),
    /// but the health endpoint reports the degraded state.
    pub renderer_available: bool,
}
