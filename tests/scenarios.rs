// End-to-end runs of the three contexts against mocked provider endpoints.
use reader_bridge::chat::provider::OpenAiCompatible;
use reader_bridge::chat::{ChatOptions, ChatRequest, ChatService, Outcome, ProviderRegistry, Role};
use reader_bridge::settings::{MemorySettingsStore, SettingsStore};
use reader_bridge::{
    BridgeError, BridgeService, ContentBridge, ContextId, LocalRuntime, MessageRouter, PopupBridge,
    SharedSubstrate, StreamUpdate,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Extension {
    runtime: SharedSubstrate,
    router:  MessageRouter,
    content: ContentBridge,
}

fn registry(server: &MockServer) -> ProviderRegistry {
    let mut registry = ProviderRegistry::empty();
    for (id, name, model) in [("qianwen", "Qianwen", "qwen-turbo"), ("zhipu", "Zhipu", "glm-4-flash")] {
        registry.insert(OpenAiCompatible::new(
            id,
            name,
            &format!("{}/{}/chat/completions", server.uri(), id),
            model,
        ));
    }
    registry
}

fn boot(server: &MockServer, settings: Value) -> Extension {
    let store: Arc<dyn SettingsStore> = Arc::new(MemorySettingsStore::with_values(settings));
    let runtime: SharedSubstrate = LocalRuntime::new();
    let chat = Arc::new(ChatService::new(store.clone(), registry(server)).unwrap());
    let router = MessageRouter::new(runtime.clone(), chat).unwrap();
    let content = ContentBridge::new(runtime.clone(), store, Some("Dune".into()), Some("Frank Herbert".into()));
    Extension { runtime, router, content }
}

fn keys() -> Value {
    json!({ "apiKeys": { "qianwen": "sk-qw", "zhipu": "sk-zp" } })
}

fn answer(text: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "choices": [{ "message": { "content": text } }] }))
}

fn sse(deltas: &[&str]) -> ResponseTemplate {
    let mut body = String::new();
    for d in deltas {
        body.push_str(&format!("data: {}\n\n", json!({ "choices": [{ "delta": { "content": d } }] })));
    }
    body.push_str("data: [DONE]\n\n");
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(body)
}

async fn drain(updates: &mut mpsc::UnboundedReceiver<StreamUpdate>) -> Vec<StreamUpdate> {
    let mut seen = Vec::new();
    while let Ok(Some(update)) = tokio::time::timeout(Duration::from_secs(5), updates.recv()).await {
        let terminal = matches!(update, StreamUpdate::Completed(_) | StreamUpdate::Failed(_));
        seen.push(update);
        if terminal {
            break;
        }
    }
    seen
}

// ── One-shot chat ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_chat_request_resolves_and_records_history() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/qianwen/chat/completions"))
        .respond_with(answer("\u{4f60}\u{597d}\u{ff01}"))
        .expect(1)
        .mount(&server)
        .await;

    let ext = boot(&server, keys());
    let reply = ext
        .content
        .chat()
        .send_message(ChatOptions::new("\u{4f60}\u{597d}").provider("qianwen"))
        .await
        .unwrap();
    assert_eq!(reply.content, "\u{4f60}\u{597d}\u{ff01}");
    assert_eq!(reply.provider, "qianwen");

    let history = ext.content.chat().conversation_history("default");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[1].content, "\u{4f60}\u{597d}\u{ff01}");
}

#[tokio::test]
async fn test_unregistered_chat_request_is_unknown_message_type() {
    let runtime: SharedSubstrate = LocalRuntime::new();
    let _background = BridgeService::new(ContextId::Background, runtime.clone());
    let store = Arc::new(MemorySettingsStore::new());
    let content = ContentBridge::new(runtime, store, None, None);

    let err = content.chat().send_message(ChatOptions::new("hi")).await.unwrap_err();
    assert_eq!(err, BridgeError::Remote("unknown message type: CHAT_REQUEST".into()));
    assert_eq!(err.to_string(), "unknown message type: CHAT_REQUEST");
}

#[tokio::test]
async fn test_concurrent_requests_get_their_own_replies() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("slow question"))
        .respond_with(answer("slow answer").set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("fast question"))
        .respond_with(answer("fast answer"))
        .mount(&server)
        .await;

    let ext = boot(&server, keys());
    let chat = ext.content.chat();
    let slow = chat.send_message(ChatOptions::new("slow question").provider("zhipu").conversation("a"));
    let fast = chat.send_message(ChatOptions::new("fast question").provider("zhipu").conversation("b"));
    let (slow, fast) = tokio::join!(slow, fast);
    assert_eq!(slow.unwrap().content, "slow answer");
    assert_eq!(fast.unwrap().content, "fast answer");
}

#[tokio::test]
async fn test_missing_key_is_reported_without_history() {
    let server = MockServer::start().await;
    let ext = boot(&server, json!({}));
    let err = ext.content.chat().send_message(ChatOptions::new("q").provider("zhipu")).await.unwrap_err();
    assert_eq!(err.to_string(), "please configure an API key for Zhipu first");
    assert!(ext.content.chat().conversation_history("default").is_empty());
}

#[tokio::test]
async fn test_current_provider_from_settings() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/zhipu/chat/completions"))
        .respond_with(answer("from zhipu"))
        .expect(1)
        .mount(&server)
        .await;

    let mut settings = keys();
    settings["currentProvider"] = json!("zhipu");
    let ext = boot(&server, settings);
    let reply = ext.content.chat().send_message(ChatOptions::new("q")).await.unwrap();
    assert_eq!(reply.provider, "zhipu");
    assert_eq!(reply.model, "glm-4-flash");
}

// ── Streaming ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stream_start_chunks_complete_and_history() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/qianwen/chat/completions"))
        .respond_with(sse(&["A", "B"]))
        .mount(&server)
        .await;

    let ext = boot(&server, keys());
    let (tx, mut updates) = mpsc::unbounded_channel();
    ext.content
        .chat()
        .send_stream_message(ChatOptions::new("entropy").action("explain").provider("qianwen"), tx)
        .unwrap();

    let seen = drain(&mut updates).await;
    assert_eq!(seen.len(), 4, "{:?}", seen);
    match &seen[0] {
        StreamUpdate::Started(start) => {
            assert_eq!(start.provider, "qianwen");
            assert_eq!(start.action, "explain");
            assert_eq!(start.model, "qwen-turbo");
        }
        other => panic!("expected start, got {:?}", other),
    }
    assert_eq!(seen[1], StreamUpdate::Chunk("A".into()));
    assert_eq!(seen[2], StreamUpdate::Chunk("B".into()));
    assert_eq!(seen[3], StreamUpdate::Completed("AB".into()));

    let history = ext.content.chat().conversation_history("default");
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content, "AB");
    assert!(ext.router.chat().in_flight().is_empty());
}

#[tokio::test]
async fn test_stream_provider_error_is_single_terminal_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .mount(&server)
        .await;

    let ext = boot(&server, keys());
    let (tx, mut updates) = mpsc::unbounded_channel();
    ext.content.chat().send_stream_message(ChatOptions::new("q").provider("zhipu"), tx).unwrap();

    let seen = drain(&mut updates).await;
    assert_eq!(seen.len(), 2, "{:?}", seen);
    assert!(matches!(seen[0], StreamUpdate::Started(_)));
    assert_eq!(seen[1], StreamUpdate::Failed("API Error: 500".into()));
    assert!(ext.content.chat().conversation_history("default").is_empty());
}

#[tokio::test]
async fn test_stream_missing_key_still_starts_before_error() {
    let server = MockServer::start().await;
    let ext = boot(&server, json!({}));
    let (tx, mut updates) = mpsc::unbounded_channel();
    ext.content.chat().send_stream_message(ChatOptions::new("q").provider("zhipu"), tx).unwrap();

    let seen = drain(&mut updates).await;
    assert_eq!(seen.len(), 2, "{:?}", seen);
    assert!(matches!(seen[0], StreamUpdate::Started(_)));
    assert_eq!(seen[1], StreamUpdate::Failed("please configure an API key for Zhipu first".into()));
}

#[tokio::test]
async fn test_cancel_before_any_chunk_is_silent_and_aborts_provider_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(sse(&["never"]).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let ext = boot(&server, keys());
    let chat = ext.content.chat();
    let background = ext.router.chat().clone();
    let (tx, mut updates) = mpsc::unbounded_channel();
    let id = chat
        .send_stream_message(ChatOptions::new("q").provider("zhipu").request_id("r1"), tx)
        .unwrap();
    assert_eq!(id, "r1");

    // Wait for the background to install the abort handle, then cancel.
    for _ in 0..100 {
        if background.in_flight() == vec!["r1".to_string()] {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(chat.cancel_stream_request("r1"));

    // The abort reaches the background long before the provider would answer.
    let mut aborted = false;
    for _ in 0..100 {
        if background.in_flight().is_empty() {
            aborted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(aborted);

    let mut late = Vec::new();
    while let Ok(Some(update)) = tokio::time::timeout(Duration::from_millis(200), updates.recv()).await {
        late.push(update);
    }
    assert!(
        late.iter().all(|u| matches!(u, StreamUpdate::Started(_))),
        "unexpected events after cancel: {:?}",
        late
    );
    assert!(chat.conversation_history("default").is_empty());
    assert_eq!(chat.status().active_streams, 0);
}

#[tokio::test]
async fn test_immediate_cancel_delivers_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(sse(&["A"]).set_delay(Duration::from_millis(100)))
        .mount(&server)
        .await;

    let ext = boot(&server, keys());
    let (tx, mut updates) = mpsc::unbounded_channel();
    let id = ext.content.chat().send_stream_message(ChatOptions::new("q").provider("zhipu"), tx).unwrap();
    assert!(ext.content.chat().cancel_stream_request(&id));

    let next = tokio::time::timeout(Duration::from_millis(400), updates.recv()).await;
    assert!(matches!(next, Ok(None)), "got {:?}", next);
    assert!(ext.content.chat().conversation_history("default").is_empty());
}

// ── Key testing ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_bad_key_rejects_with_provider_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/zhipu/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "error": { "message": "invalid key" } })))
        .mount(&server)
        .await;

    let ext = boot(&server, json!({}));
    let err = ext
        .router
        .chat()
        .test_api_connection("zhipu", Some("badkey"), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("invalid key"));

    let err = ext.content.chat().test_api_key("zhipu", Some("badkey"), None).await.unwrap_err();
    assert!(err.to_string().contains("invalid key"));

    let popup = PopupBridge::new(ext.runtime.clone());
    let result = popup.test_api_connection("zhipu", Some("badkey"), None).await;
    assert!(!result.success);
    assert!(result.message.contains("invalid key"));
}

#[tokio::test]
async fn test_chat_request_test_flag_runs_connection_test() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(answer("OK, the connection works fine and this reply is long enough to be cut"))
        .mount(&server)
        .await;

    let ext = boot(&server, json!({}));
    let request = ChatRequest {
        provider: Some("zhipu".into()),
        api_key:  Some("sk-new".into()),
        is_test:  true,
        ..Default::default()
    };
    let data = ext
        .content
        .bridge()
        .send(
            reader_bridge::MessageType::ChatRequest,
            serde_json::to_value(&request).unwrap(),
            reader_bridge::SendOptions::to(ContextId::Background),
        )
        .await
        .unwrap();
    assert_eq!(data["success"], true);
    assert_eq!(data["response"].as_str().unwrap().chars().count(), 50);
}

#[tokio::test]
async fn test_connection_test_and_chat_send_identical_bodies() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(answer("OK")).mount(&server).await;

    let settings = json!({
        "apiKeys":      { "zhipu": "sk-zp" },
        "models":       { "zhipu": "glm-4-plus" },
        "temperatures": { "zhipu": 0.4 },
    });
    let ext = boot(&server, settings);
    let chat = ext.router.chat();

    chat.test_api_connection("zhipu", None, None).await.unwrap();
    let request = ChatRequest { provider: Some("zhipu".into()), text: "why?".into(), ..Default::default() };
    assert!(matches!(chat.process_request(&request).await.unwrap(), Outcome::Done(_)));

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 2);
    let mut bodies: Vec<Value> = received.iter().map(|r| serde_json::from_slice(&r.body).unwrap()).collect();
    for body in bodies.iter_mut() {
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
        body.as_object_mut().unwrap().remove("messages");
    }
    assert_eq!(bodies[0], bodies[1]);
    assert_eq!(bodies[0], json!({ "model": "glm-4-plus", "stream": false, "temperature": 0.4 }));
}

// ── Settings fan-out ────────────────────────────────────────────────────

#[tokio::test]
async fn test_settings_change_broadcast_reaches_every_tab() {
    let server = MockServer::start().await;
    let ext = boot(&server, keys());
    let second_tab = ContentBridge::new(ext.runtime.clone(), Arc::new(MemorySettingsStore::new()), None, None);

    let mut first = ext.content.settings_events().unwrap();
    let mut second = second_tab.settings_events().unwrap();

    let summary = ext
        .router
        .notify_settings_changed(json!({ "currentProvider": "kimi" }))
        .await
        .unwrap();
    assert_eq!(summary.delivered, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(first.recv().await.unwrap()["currentProvider"], "kimi");
    assert_eq!(second.recv().await.unwrap()["currentProvider"], "kimi");
    assert!(ext.content.is_connected().await);
}
