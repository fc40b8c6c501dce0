pub mod error;
pub mod paths;
pub mod store;
pub mod transcript;

pub use error::StoreError;
pub use paths::{default_transcripts_dir, project_slug};
pub use store::TranscriptStore;
