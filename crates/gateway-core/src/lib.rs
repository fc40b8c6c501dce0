pub mod backend;
pub mod errors;
pub mod events;
pub mod ids;
pub mod session;
pub mod sse;

pub use errors::BackendError;
pub use events::StreamEvent;
pub use ids::{SessionId, ToolCallId};
pub use session::PermissionMode;
