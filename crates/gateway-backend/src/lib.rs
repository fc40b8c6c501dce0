pub mod cli;
pub mod mock;

pub use cli::{ClaudeCliBackend, ClaudeCliConfig};
pub use mock::{MockBackend, MockResponse, MockStep};
