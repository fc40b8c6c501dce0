#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid session id: {0}")]
    InvalidId(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}
