use gateway_core::ids::SessionId;

/// Reasons a turn is refused before any event is produced. Failures after
/// the turn starts are reported in-band as `error` events instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("content is required")]
    EmptyPrompt,

    #[error("a turn is already running for session {0}")]
    TurnInProgress(SessionId),
}
