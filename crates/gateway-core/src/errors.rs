/// Failures raised by an agent backend while a turn is streaming.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to start backend: {0}")]
    Spawn(String),
    #[error("backend io error: {0}")]
    Io(String),
    #[error("backend protocol error: {0}")]
    Protocol(String),
    #[error("backend exited with {status}: {stderr}")]
    Exited { status: String, stderr: String },
    #[error("cancelled")]
    Cancelled,
}

impl BackendError {
    /// Short machine-readable code, carried in the `code` field of `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Spawn(_) => "backend_spawn",
            Self::Io(_) => "backend_io",
            Self::Protocol(_) => "backend_protocol",
            Self::Exited { .. } => "backend_exited",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_detail() {
        let e = BackendError::Exited {
            status: "exit status: 1".into(),
            stderr: "auth required".into(),
        };
        assert_eq!(e.to_string(), "backend exited with exit status: 1: auth required");
        assert_eq!(e.code(), "backend_exited");
    }

    #[test]
    fn from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let e: BackendError = io.into();
        assert!(matches!(e, BackendError::Io(ref m) if m.contains("pipe closed")));
    }
}
