pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod server;
pub mod sse;

pub use config::GatewayConfig;
pub use error::ApiError;
pub use server::{build_router, start, AppState, ServerHandle};
