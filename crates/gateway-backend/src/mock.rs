use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use gateway_core::backend::{
    AgentBackend, ApprovalRequest, BackendEvent, BackendStream, QueryRequest, RawMessage,
};
use gateway_core::errors::BackendError;
use gateway_core::ids::ToolCallId;

/// One scripted step of a mock turn.
#[derive(Clone, Debug)]
pub enum MockStep {
    Message(RawMessage),
    /// Yield a mid-stream failure and end the stream.
    Fail(BackendError),
    Pause(Duration),
    /// Ask for approval and block until answered; the answer is recorded.
    Approval {
        tool_call_id: String,
        tool_name: String,
        input: serde_json::Value,
    },
}

/// Pre-programmed responses for deterministic testing without a real CLI.
#[derive(Clone, Debug)]
pub enum MockResponse {
    Stream(Vec<MockStep>),
    /// Fail the `query()` call itself.
    Error(BackendError),
    /// Wait a duration, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn messages(messages: Vec<RawMessage>) -> Self {
        Self::Stream(messages.into_iter().map(MockStep::Message).collect())
    }

    /// init → text → result, the shape of a plain answer.
    pub fn text_turn(backend_session_id: &str, text: &str) -> Self {
        Self::messages(vec![
            RawMessage::init(backend_session_id),
            RawMessage::text_block_start(),
            RawMessage::text_delta(text),
            RawMessage::block_stop(),
            RawMessage::result(),
        ])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock backend that answers queries with pre-programmed responses in order
/// and records every request it receives.
#[derive(Default)]
pub struct MockBackend {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<QueryRequest>>,
    decisions: Arc<Mutex<Vec<(String, bool)>>>,
}

impl MockBackend {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Default::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<QueryRequest> {
        self.requests.lock().clone()
    }

    /// Approval answers received so far, as (tool call id, allowed).
    pub fn decisions(&self) -> Vec<(String, bool)> {
        self.decisions.lock().clone()
    }
}

#[async_trait]
impl AgentBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn query(&self, request: QueryRequest) -> Result<BackendStream, BackendError> {
        let idx = {
            let mut requests = self.requests.lock();
            requests.push(request);
            requests.len() - 1
        };
        let Some(mut response) = self.responses.lock().pop_front() else {
            return Err(BackendError::Spawn(format!(
                "MockBackend: no response configured for call {idx}"
            )));
        };

        loop {
            match response {
                MockResponse::Stream(steps) => return Ok(play(steps, self.decisions.clone())),
                MockResponse::Error(e) => return Err(e),
                MockResponse::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    response = *inner;
                }
            }
        }
    }
}

fn play(steps: Vec<MockStep>, decisions: Arc<Mutex<Vec<(String, bool)>>>) -> BackendStream {
    Box::pin(async_stream::stream! {
        for step in steps {
            match step {
                MockStep::Message(msg) => yield Ok(BackendEvent::Message(msg)),
                MockStep::Fail(e) => {
                    yield Err(e);
                    return;
                }
                MockStep::Pause(d) => tokio::time::sleep(d).await,
                MockStep::Approval { tool_call_id, tool_name, input } => {
                    let (reply, decision) = oneshot::channel();
                    yield Ok(BackendEvent::Approval(ApprovalRequest {
                        tool_call_id: ToolCallId::from_raw(tool_call_id.clone()),
                        tool_name,
                        input,
                        reply,
                    }));
                    let allowed = decision.await.unwrap_or(false);
                    decisions.lock().push((tool_call_id, allowed));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use gateway_core::backend::BackendPermission;

    fn request() -> QueryRequest {
        QueryRequest {
            prompt: "hi".into(),
            resume: None,
            permission: BackendPermission::AcceptEdits,
            cwd: std::env::temp_dir(),
        }
    }

    async fn collect(stream: BackendStream) -> Vec<Result<BackendEvent, BackendError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn text_turn_yields_scripted_messages() {
        let mock = MockBackend::new(vec![MockResponse::text_turn("b-1", "hello")]);
        let items = collect(mock.query(request()).await.unwrap()).await;
        assert_eq!(items.len(), 5);
        assert!(matches!(
            &items[0],
            Ok(BackendEvent::Message(m)) if *m == RawMessage::init("b-1")
        ));
        assert!(matches!(
            &items[4],
            Ok(BackendEvent::Message(RawMessage::Result { .. }))
        ));
    }

    #[tokio::test]
    async fn error_response_fails_query() {
        let mock = MockBackend::new(vec![MockResponse::Error(BackendError::Spawn("nope".into()))]);
        assert!(mock.query(request()).await.is_err());
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_script_fails() {
        let mock = MockBackend::new(vec![]);
        assert!(matches!(
            mock.query(request()).await,
            Err(BackendError::Spawn(_))
        ));
    }

    #[tokio::test]
    async fn fail_step_ends_stream() {
        let mock = MockBackend::new(vec![MockResponse::Stream(vec![
            MockStep::Message(RawMessage::text_delta("a")),
            MockStep::Fail(BackendError::Io("broken pipe".into())),
            MockStep::Message(RawMessage::result()),
        ])]);
        let items = collect(mock.query(request()).await.unwrap()).await;
        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn approval_decision_is_recorded() {
        let mock = MockBackend::new(vec![MockResponse::Stream(vec![
            MockStep::Approval {
                tool_call_id: "t1".into(),
                tool_name: "Bash".into(),
                input: serde_json::json!({"command": "ls"}),
            },
            MockStep::Message(RawMessage::result()),
        ])]);
        let mut stream = mock.query(request()).await.unwrap();
        match stream.next().await {
            Some(Ok(BackendEvent::Approval(req))) => req.reply.send(false).unwrap(),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(stream.next().await.is_some());
        assert_eq!(mock.decisions(), vec![("t1".to_string(), false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_response() {
        let mock = MockBackend::new(vec![MockResponse::delayed(
            Duration::from_secs(5),
            MockResponse::text_turn("b", "x"),
        )]);
        let start = tokio::time::Instant::now();
        let _ = mock.query(request()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn sequential_responses_and_recorded_requests() {
        let mock = MockBackend::new(vec![
            MockResponse::text_turn("b", "first"),
            MockResponse::text_turn("b", "second"),
        ]);
        let _ = mock.query(request()).await.unwrap();
        let mut second = request();
        second.prompt = "again".into();
        let _ = mock.query(second).await.unwrap();
        let prompts: Vec<_> = mock.requests().into_iter().map(|r| r.prompt).collect();
        assert_eq!(prompts, vec!["hi", "again"]);
    }
}
