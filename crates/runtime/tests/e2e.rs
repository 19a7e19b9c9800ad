//! End-to-end turn and trigger-run scenarios, run against a real
//! [`shrimp_store::SqliteStore`] (in-memory), a real
//! [`shrimp_tools::ToolRegistry`], and a scripted fake [`LlmClient`] instead
//! of a network call.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use shrimp_config::AppConfig;
use shrimp_llm::{ChatMessage, ChatResponse, LlmClient, LlmError, ToolCall, ToolCallFunction};
use shrimp_runtime::{EventSink, NullSink, Runtime, TurnRequest};
use shrimp_shell::ShellPool;
use shrimp_store::{SqliteStore, Store, TriggerKind};
use shrimp_tools::{build_registry, ToolContext};

/// Replays a fixed sequence of [`ChatResponse`]s, one per call to `complete`,
/// and panics if exhausted — surfaces test bugs immediately rather than
/// silently returning an empty reply.
struct ScriptedLlm {
    responses: std::sync::Mutex<Vec<ScriptedStep>>,
    calls: AtomicUsize,
}

enum ScriptedStep {
    Response(ChatResponse),
    Fail(String),
}

impl ScriptedLlm {
    fn new(steps: Vec<ScriptedStep>) -> Arc<Self> {
        Arc::new(Self { responses: std::sync::Mutex::new(steps), calls: AtomicUsize::new(0) })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(
        &self,
        _model: &str,
        _messages: &[ChatMessage],
        _tools: Option<&Value>,
    ) -> shrimp_llm::Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut steps = self.responses.lock().unwrap();
        if steps.is_empty() {
            panic!("ScriptedLlm exhausted its script");
        }
        match steps.remove(0) {
            ScriptedStep::Response(r) => Ok(r),
            ScriptedStep::Fail(msg) => Err(LlmError::Upstream(msg)),
        }
    }
}

fn text_only(content: &str) -> ScriptedStep {
    ScriptedStep::Response(ChatResponse {
        content: Some(content.to_string()),
        tool_calls: vec![],
        finish_reason: "stop".to_string(),
    })
}

fn tool_call(name: &str, args: Value) -> ScriptedStep {
    ScriptedStep::Response(ChatResponse {
        content: None,
        tool_calls: vec![ToolCall {
            id: "call_1".to_string(),
            r#type: "function".to_string(),
            function: ToolCallFunction { name: name.to_string(), arguments: args },
        }],
        finish_reason: "tool_calls".to_string(),
    })
}

async fn test_runtime(llm: Arc<ScriptedLlm>) -> Runtime {
    let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let shell = ShellPool::new(AppConfig::default().shell);
    let ctx = ToolContext::new(shell, dir.path().to_path_buf(), dir.path().join("memory.json"));
    let tools = Arc::new(build_registry(ctx));
    Runtime::new(AppConfig::default(), Arc::new(store), llm, tools)
}

/// Scenario 1: simple echo — no tool calls, one bubble, one stored assistant
/// message in a brand-new conversation.
#[tokio::test]
async fn scenario_simple_echo() {
    let llm = ScriptedLlm::new(vec![text_only("hi there.")]);
    let runtime = test_runtime(llm.clone()).await;

    #[derive(Default)]
    struct Recorder {
        events: std::sync::Mutex<Vec<String>>,
    }
    impl EventSink for Recorder {
        fn on_conversation(&self, conversation_id: &str) {
            self.events.lock().unwrap().push(format!("conversation:{conversation_id}"));
        }
        fn on_assistant_bubble_start(&self, bubble_id: &str) {
            self.events.lock().unwrap().push(format!("bubble_start:{bubble_id}"));
        }
        fn on_assistant_token(&self, bubble_id: &str, value: &str) {
            self.events.lock().unwrap().push(format!("token:{bubble_id}:{value}"));
        }
        fn on_assistant_done(&self) {
            self.events.lock().unwrap().push("assistant_done".to_string());
        }
    }
    let sink = Recorder::default();

    let result = runtime
        .run_turn(
            TurnRequest { message: "say hi".to_string(), ..Default::default() },
            &sink,
            &shrimp_runtime::CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.bubbles, vec!["hi there.".to_string()]);
    assert_eq!(llm.call_count(), 1);

    let events = sink.events.lock().unwrap();
    assert!(events[0].starts_with("conversation:"));
    assert!(events.iter().any(|e| e.starts_with("bubble_start:")));
    let reconstructed: String = events
        .iter()
        .filter_map(|e| e.strip_prefix("token:").and_then(|rest| rest.split_once(':')).map(|(_, v)| v))
        .collect();
    assert_eq!(reconstructed, "hi there.");
    assert_eq!(events.last().unwrap(), "assistant_done");

    let messages = runtime.store.list_messages(&result.conversation_id).await.unwrap();
    let assistant_count = messages.iter().filter(|m| m.role == shrimp_store::Role::Assistant).count();
    assert_eq!(assistant_count, 1);
}

/// Scenario 2: one round of `run_command`, then a summarizing reply.
#[tokio::test]
async fn scenario_command_then_summary() {
    let llm = ScriptedLlm::new(vec![
        tool_call("run_command", json!({"command": "echo shrimp"})),
        text_only("Got: shrimp"),
    ]);
    let runtime = test_runtime(llm.clone()).await;

    let result = runtime
        .run_turn(
            TurnRequest { message: "echo shrimp and tell me".to_string(), ..Default::default() },
            &NullSink,
            &shrimp_runtime::CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.bubbles, vec!["Got: shrimp".to_string()]);
    assert_eq!(llm.call_count(), 2);

    let tool_calls = runtime.store.list_tool_calls(&result.conversation_id).await.unwrap();
    assert_eq!(tool_calls.len(), 1);
    assert_eq!(tool_calls[0].tool_name, "run_command");
    assert_eq!(tool_calls[0].status, shrimp_store::ToolCallStatus::Success);
}

/// Scenario 5: a trigger run whose bubbles contain `<final_result>`.
#[tokio::test]
async fn scenario_trigger_run_final_result() {
    let llm = ScriptedLlm::new(vec![text_only("Found it.\n\n<final_result>/tmp/x.txt</final_result>")]);
    let runtime = test_runtime(llm).await;

    let outcome = runtime
        .run_trigger(TriggerKind::Manual, "Find X", None, None)
        .await
        .unwrap();

    assert_eq!(outcome.final_result.as_deref(), Some("/tmp/x.txt"));
    assert_eq!(outcome.run.status, shrimp_store::TriggerStatus::Success);
    assert_eq!(outcome.run.final_result.as_deref(), Some("/tmp/x.txt"));
}

/// Scenario 6: the LLM call fails; the turn errors out and, for the
/// trigger-run variant, the run is persisted as `status=error`.
#[tokio::test]
async fn scenario_assistant_error_surfaces() {
    let llm = ScriptedLlm::new(vec![ScriptedStep::Fail("upstream down".to_string())]);
    let runtime = test_runtime(llm).await;

    let err = runtime
        .run_turn(
            TurnRequest { message: "anything".to_string(), ..Default::default() },
            &NullSink,
            &shrimp_runtime::CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("upstream down"));
}

#[tokio::test]
async fn scenario_assistant_error_surfaces_in_trigger_run() {
    let llm = ScriptedLlm::new(vec![ScriptedStep::Fail("upstream down".to_string())]);
    let runtime = test_runtime(llm).await;

    let err = runtime.run_trigger(TriggerKind::Manual, "do something", None, None).await.unwrap_err();
    assert!(err.to_string().contains("upstream down"));

    let runs = runtime.store.list_trigger_runs(10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, shrimp_store::TriggerStatus::Error);
}
