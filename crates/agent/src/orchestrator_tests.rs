//! End-to-end turns against scripted providers and stub tool servers.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use vigil::error::{CoreError, CoreResult};
use vigil::mcp::ToolBroker;
use vigil::provider::ModelProvider;

use crate::domain::ChatMessageKind;
use crate::event_bus::EventBus;
use crate::events::{AgentEvent, EventHandler, EventName};
use crate::middleware::{MessageContext, MessageMiddleware, MiddlewareSet};
use crate::orchestrator::{ConversationOrchestrator, OrchestratorConfig};
use crate::store::{KnowledgeStore, SqliteKnowledgeStore};
use crate::test_utils::{stub_broker, timing_out_broker, EchoProvider, ScriptedProvider, StubTool};

/// Records every event name it sees, in order.
struct EventRecorder {
    seen: Mutex<Vec<EventName>>,
}

impl EventRecorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }

    fn names(&self) -> Vec<EventName> {
        self.seen.lock().clone()
    }

    fn count(&self, name: EventName) -> usize {
        self.seen.lock().iter().filter(|n| **n == name).count()
    }
}

#[async_trait]
impl EventHandler for EventRecorder {
    async fn on_event(&self, event: &AgentEvent) -> Result<Option<Value>, CoreError> {
        self.seen.lock().push(event.name);
        Ok(None)
    }
}

const ALL_BOT_EVENTS: &[EventName] = &[
    EventName::ChatStarted,
    EventName::MessageSent,
    EventName::MessageReceived,
    EventName::TurnComplete,
    EventName::ToolUse,
    EventName::ToolResult,
    EventName::Thought,
    EventName::Summarized,
    EventName::TokenUsage,
    EventName::TokenEstimate,
];

async fn runtime(
    provider: Arc<dyn ModelProvider>,
    broker: ToolBroker,
) -> (
    ConversationOrchestrator,
    Arc<dyn KnowledgeStore>,
    Arc<EventRecorder>,
) {
    let store: Arc<dyn KnowledgeStore> =
        Arc::new(SqliteKnowledgeStore::connect_in_memory().await.unwrap());
    let bus = Arc::new(EventBus::new());
    let recorder = EventRecorder::new();
    bus.subscribe_all(ALL_BOT_EVENTS, recorder.clone());

    let orchestrator =
        ConversationOrchestrator::new(provider, store.clone(), Arc::new(broker), bus);
    (orchestrator, store, recorder)
}

async fn started(
    provider: Arc<dyn ModelProvider>,
    broker: ToolBroker,
) -> (
    ConversationOrchestrator,
    Arc<dyn KnowledgeStore>,
    Arc<EventRecorder>,
) {
    let (orchestrator, store, recorder) = runtime(provider, broker).await;
    orchestrator
        .start_chat("s1", "ada", "c1", Some("test"), Some("identity".into()))
        .await
        .unwrap();
    (orchestrator, store, recorder)
}

fn kinds_of(messages: &[crate::domain::Node]) -> Vec<(String, String)> {
    messages
        .iter()
        .map(|m| {
            (
                m.property_str("role").unwrap_or("?").to_string(),
                m.property_str("message_type").unwrap_or("?").to_string(),
            )
        })
        .collect()
}

// A plain text turn with no tools.
#[tokio::test]
async fn simple_turn_round_trips_and_persists_both_messages() {
    let (orchestrator, store, recorder) =
        started(Arc::new(EchoProvider), stub_broker(vec![]).await).await;

    let reply = orchestrator.send_message("world", None).await.unwrap();
    assert_eq!(reply, "hello world");

    let messages = store.get_chat_messages("c1", None, 0, false).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content.as_deref(), Some("world"));
    assert_eq!(messages[0].property_str("role"), Some("user"));
    assert_eq!(messages[1].content.as_deref(), Some("hello world"));
    assert_eq!(messages[1].property_str("role"), Some("model"));

    // Event order within the turn.
    let names = recorder.names();
    let sent = names
        .iter()
        .position(|n| *n == EventName::MessageSent)
        .unwrap();
    let received = names
        .iter()
        .position(|n| *n == EventName::MessageReceived)
        .unwrap();
    let complete = names
        .iter()
        .position(|n| *n == EventName::TurnComplete)
        .unwrap();
    assert!(sent < received && received < complete);
}

// One tool call, then a final answer.
#[tokio::test]
async fn tool_call_turn_dispatches_and_persists_tool_messages() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_response("add", json!({"a": 2, "b": 3})),
        ScriptedProvider::text_response("answer=5"),
    ]));
    let broker = stub_broker(vec![StubTool::tool("add", "5")]).await;
    let (orchestrator, store, recorder) = started(provider, broker).await;

    let reply = orchestrator.send_message("compute", None).await.unwrap();
    assert_eq!(reply, "answer=5");

    assert_eq!(recorder.count(EventName::ToolUse), 1);
    assert_eq!(recorder.count(EventName::ToolResult), 1);
    let names = recorder.names();
    let use_pos = names.iter().position(|n| *n == EventName::ToolUse).unwrap();
    let result_pos = names
        .iter()
        .position(|n| *n == EventName::ToolResult)
        .unwrap();
    assert!(use_pos < result_pos);

    let messages = store.get_chat_messages("c1", None, 0, false).await.unwrap();
    let kinds = kinds_of(&messages);
    assert!(kinds.contains(&("model".to_string(), "tool_use".to_string())));
    assert!(kinds.contains(&("user".to_string(), "tool_result".to_string())));

    let tool_use = messages
        .iter()
        .find(|m| m.property_str("message_type") == Some("tool_use"))
        .unwrap();
    assert_eq!(tool_use.property_str("tool_name"), Some("add"));
    assert_eq!(tool_use.properties["tool_args"]["a"], 2);
}

// The tool server always times out; the turn survives.
#[tokio::test(start_paused = true)]
async fn tool_timeout_feeds_error_result_back_without_failing_turn() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_response("add", json!({"a": 1, "b": 1})),
        ScriptedProvider::text_response("the tool is down"),
    ]));
    let (orchestrator, _store, recorder) = started(provider, timing_out_broker().await).await;

    let reply = orchestrator.send_message("compute", None).await.unwrap();
    assert_eq!(reply, "the tool is down");
    assert_eq!(recorder.count(EventName::ToolResult), 1);
}

#[tokio::test]
async fn unknown_tool_names_become_synthetic_error_results() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_response("no_such_tool", json!({})),
        ScriptedProvider::text_response("done"),
    ]));
    let (orchestrator, store, _) = started(provider.clone(), stub_broker(vec![]).await).await;

    let reply = orchestrator.send_message("go", None).await.unwrap();
    assert_eq!(reply, "done");

    // The model saw the synthetic error as a tool result.
    let sent = provider.sent.lock();
    let vigil::provider::ProviderInput::ToolResults(outcomes) = &sent[1] else {
        panic!("expected tool results to go back to the model");
    };
    assert!(outcomes[0].result.contains("unknown tool"));
    drop(sent);

    let messages = store.get_chat_messages("c1", None, 0, false).await.unwrap();
    assert!(messages
        .iter()
        .any(|m| m.property_str("message_type") == Some("tool_result")));
}

#[tokio::test]
async fn tool_loop_cap_fails_the_turn() {
    // A provider that asks for a tool on every request, forever.
    let responses: Vec<_> = (0..30)
        .map(|_| ScriptedProvider::tool_call_response("add", json!({})))
        .collect();
    let provider = Arc::new(ScriptedProvider::new(responses));
    let broker = stub_broker(vec![StubTool::tool("add", "1")]).await;
    let (orchestrator, _, _) = started(provider, broker).await;

    let err = {
        // Tight cap keeps the test fast.
        let orchestrator = orchestrator.with_config(OrchestratorConfig {
            max_tool_iterations: 3,
            ..Default::default()
        });
        orchestrator
            .start_chat("s1", "ada", "c1", None, Some("id".into()))
            .await
            .unwrap();
        orchestrator.send_message("loop", None).await.unwrap_err()
    };
    assert!(matches!(err, CoreError::Model(_)));
    assert!(err.to_string().contains("3 iterations"));
}

#[tokio::test]
async fn skip_model_short_circuits_with_canned_response() {
    struct Canned;
    #[async_trait]
    impl MessageMiddleware for Canned {
        fn name(&self) -> &'static str {
            "canned"
        }
        async fn handle(
            &self,
            ctx: &mut MessageContext,
            _broker: &ToolBroker,
        ) -> CoreResult<()> {
            if ctx.effective_message() == "ping" {
                ctx.skip_model = true;
                ctx.response = Some("pong".to_string());
            }
            Ok(())
        }
    }

    let provider = Arc::new(ScriptedProvider::new(Vec::new()));
    let (orchestrator, store, recorder) = runtime(provider.clone(), stub_broker(vec![]).await).await;
    let orchestrator = orchestrator.with_middleware(MiddlewareSet::new().with_message(Canned));
    orchestrator
        .start_chat("s1", "ada", "c1", None, Some("id".into()))
        .await
        .unwrap();

    let reply = orchestrator.send_message("ping", None).await.unwrap();
    assert_eq!(reply, "pong");
    // The provider was never consulted.
    assert!(provider.sent.lock().is_empty());
    assert_eq!(recorder.count(EventName::TurnComplete), 1);

    let messages = store.get_chat_messages("c1", None, 0, false).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content.as_deref(), Some("pong"));
}

// Token pressure at start_chat produces exactly one summary checkpoint.
#[tokio::test]
async fn summary_triggers_once_when_threshold_exceeded() {
    let store: Arc<dyn KnowledgeStore> =
        Arc::new(SqliteKnowledgeStore::connect_in_memory().await.unwrap());
    store.create_chat("c1", "ada", "big chat").await.unwrap();

    // Seed history past 85% of a 1000-token window.
    let service = crate::messages::MessageService::new(store.clone());
    for i in 0..10 {
        service
            .save_message(crate::messages::SaveMessage::new(
                "c1",
                format!("{} {}", "wordy ".repeat(80), i),
                vigil::chat::ChatRole::User,
                ChatMessageKind::Message,
            ))
            .await
            .unwrap();
    }

    let provider = Arc::new(
        ScriptedProvider::new(vec![ScriptedProvider::text_response(
            "everything so far, condensed",
        )])
        .with_context_window(1000),
    );
    let bus = Arc::new(EventBus::new());
    let recorder = EventRecorder::new();
    bus.subscribe_all(ALL_BOT_EVENTS, recorder.clone());

    let orchestrator = ConversationOrchestrator::new(
        provider,
        store.clone(),
        Arc::new(stub_broker(vec![]).await),
        bus,
    );
    orchestrator
        .start_chat("s1", "ada", "c1", None, Some("id".into()))
        .await
        .unwrap();

    assert_eq!(recorder.count(EventName::Summarized), 1);
    let summary = service.latest_summary("c1").await.unwrap().unwrap();
    assert_eq!(
        summary.content.as_deref(),
        Some("everything so far, condensed")
    );

    // The budget walk now starts at the checkpoint.
    let window = service
        .get_messages_within_token_limit("c1", 1_000_000, true)
        .await
        .unwrap();
    assert_eq!(
        window[0].property_str("message_type"),
        Some("summary"),
        "window should begin at the summary checkpoint"
    );
}

#[tokio::test]
async fn no_summary_below_threshold() {
    let provider = Arc::new(ScriptedProvider::new(Vec::new()).with_context_window(1_000_000));
    let (orchestrator, _, recorder) = runtime(provider, stub_broker(vec![]).await).await;
    orchestrator
        .start_chat("s1", "ada", "c1", None, Some("id".into()))
        .await
        .unwrap();
    assert_eq!(recorder.count(EventName::Summarized), 0);
}

#[tokio::test]
async fn provider_failure_surfaces_as_model_error() {
    let provider = Arc::new(ScriptedProvider::failing("provider refused"));
    let (orchestrator, _, _) = started(provider, stub_broker(vec![]).await).await;
    let err = orchestrator.send_message("hi", None).await.unwrap_err();
    assert!(matches!(err, CoreError::Model(_)));
}

#[tokio::test]
async fn send_before_start_is_a_validation_error() {
    let provider = Arc::new(ScriptedProvider::new(Vec::new()));
    let (orchestrator, _, _) = runtime(provider, stub_broker(vec![]).await).await;
    let err = orchestrator.send_message("hi", None).await.unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}

#[tokio::test]
async fn internal_exchange_is_persisted_but_hidden_from_recent_view() {
    let (orchestrator, store, _) =
        started(Arc::new(EchoProvider), stub_broker(vec![]).await).await;
    orchestrator
        .inject_internal_exchange("you are the subconscious", "acknowledged")
        .await
        .unwrap();

    let all = store.get_chat_messages("c1", None, 0, false).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|m| m.property_bool("internal")));

    let visible = orchestrator
        .message_service()
        .get_recent_messages("c1", 10)
        .await
        .unwrap();
    assert!(visible.is_empty());
}
