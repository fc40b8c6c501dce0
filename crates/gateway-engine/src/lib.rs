pub mod error;
pub mod executor;
pub mod mapper;
pub mod reaper;
pub mod registry;
pub mod tools;

pub use error::EngineError;
pub use executor::{TurnExecutor, TurnRequest, TurnStream};
pub use reaper::{start_health_reaper, DEFAULT_SWEEP_INTERVAL};
pub use registry::{SessionOptions, SessionRegistry, SessionSnapshot, DEFAULT_IDLE_TIMEOUT};
