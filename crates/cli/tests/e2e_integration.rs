//! End-to-end tests for the ClawLink gateway.
//!
//! Each test starts a real server on a loopback port, connects over
//! WebSocket and drives a session the way a client would: user messages,
//! tool call round trips, interrupts and reconnects.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use clawlink_agent::{AgentRuntime, ExecutorSettings};
use clawlink_core::error::ProviderError;
use clawlink_core::message::{ToolInvocation, TurnRecord};
use clawlink_core::provider::{Provider, ProviderRequest, ProviderResponse};
use clawlink_gateway::{GatewayState, build_router};
use clawlink_memory::{InMemoryTurnStore, PersistenceWriter, TurnStore};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;

// ── Mock Provider ────────────────────────────────────────────────────────

/// Plays back scripted responses; `None` never answers.
struct ScriptedProvider {
    responses: Mutex<Vec<Option<ProviderResponse>>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    fn new(responses: Vec<Option<ProviderResponse>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let next = {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(ProviderError::ApiError {
                    status_code: 500,
                    message: "script exhausted".into(),
                });
            }
            responses.remove(0)
        };
        match next {
            Some(response) => Ok(response),
            None => std::future::pending().await,
        }
    }
}

fn text(content: &str) -> Option<ProviderResponse> {
    Some(ProviderResponse::text(content, "mock-model"))
}

fn calls(id: &str, name: &str, args: Value) -> Option<ProviderResponse> {
    Some(ProviderResponse {
        content: String::new(),
        tool_calls: vec![ToolInvocation::new(id, name, args.to_string())],
        usage: None,
        model: "mock-model".into(),
    })
}

// ── Harness ──────────────────────────────────────────────────────────────

struct Server {
    addr: std::net::SocketAddr,
    runtime: Arc<AgentRuntime>,
    store: Arc<InMemoryTurnStore>,
    _writer: PersistenceWriter,
}

async fn start_server(provider: Arc<ScriptedProvider>) -> Server {
    let store = Arc::new(InMemoryTurnStore::new());
    let runtime = AgentRuntime::new(
        provider,
        Arc::new(clawlink_tools::default_registry()),
        ExecutorSettings {
            system_prompt: Some("You are a test agent.".into()),
            ..ExecutorSettings::default()
        },
    )
    .with_store(store.clone());
    let writer = PersistenceWriter::spawn(store.clone(), runtime.dispatcher());
    let runtime = Arc::new(runtime.with_flusher(writer.flusher()));

    let app = build_router(Arc::new(GatewayState {
        runtime: runtime.clone(),
    }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Server {
        addr,
        runtime,
        store,
        _writer: writer,
    }
}

type Socket = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(server: &Server, session: &str) -> Socket {
    let url = format!("ws://{}/v1/ws?session={session}", server.addr);
    let (socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    socket
}

async fn send(socket: &mut Socket, frame: Value) {
    socket.send(Message::text(frame.to_string())).await.unwrap();
}

async fn recv(socket: &mut Socket) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("no frame within 5s")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Read frames until one of `frame_type` arrives; returns everything read.
async fn recv_until(socket: &mut Socket, frame_type: &str) -> Vec<Value> {
    let mut seen = Vec::new();
    loop {
        let frame = recv(socket).await;
        let done = frame["type"] == frame_type;
        seen.push(frame);
        if done {
            return seen;
        }
    }
}

fn user_message(session: &str, request_id: &str, content: &str, tools: Value) -> Value {
    json!({
        "type": "USER_MESSAGE",
        "session_code": session,
        "request_id": request_id,
        "content": content,
        "data": { "tool_schemas": tools },
        "timestamp": 0
    })
}

async fn wait_for_records(store: &InMemoryTurnStore, session: &str, count: usize) -> Vec<TurnRecord> {
    for _ in 0..500 {
        let records = store.load(session).await.unwrap();
        if records.len() >= count {
            return records;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("store never reached {count} records for {session}");
}

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn client_tool_round_trip_over_websocket() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        calls("c1", "read_file", json!({ "path": "notes.txt" })),
        text("The file says hi."),
    ]));
    let server = start_server(provider.clone()).await;
    let mut socket = connect(&server, "s1").await;

    let tools = json!([{ "name": "read_file", "description": "Read a file",
                         "input_schema": { "type": "object" } }]);
    send(&mut socket, user_message("s1", "r1", "what is in notes.txt?", tools)).await;

    let before = recv_until(&mut socket, "AGENT_TOOL_CALL_REQUEST").await;
    assert!(
        before
            .iter()
            .any(|f| f["type"] == "AGENT_PROMPT" && f["data"]["prompt_type"] == "THINKING")
    );
    let request = before.last().unwrap();
    assert_eq!(request["session_code"], "s1");
    assert_eq!(request["request_id"], "r1");
    assert_eq!(request["data"]["tool_call_id"], "c1");
    assert_eq!(request["data"]["tool_name"], "read_file");
    assert_eq!(request["data"]["is_client_tool"], true);

    send(
        &mut socket,
        json!({
            "type": "AGENT_TOOL_CALL_RESPONSE",
            "session_code": "s1",
            "request_id": "r1",
            "data": { "tool_call_id": "c1", "tool_name": "read_file", "result": "hi" }
        }),
    )
    .await;

    let complete = recv_until(&mut socket, "AGENT_COMPLETE").await.pop().unwrap();
    assert_eq!(complete["data"]["outcome"], "completed");
    assert_eq!(complete["content"], "The file says hi.");

    let records = wait_for_records(&server.store, "s1", 4).await;
    assert_eq!(
        records,
        vec![
            TurnRecord::user("what is in notes.txt?"),
            TurnRecord::assistant_with_tools(
                "",
                vec![ToolInvocation::new("c1", "read_file", json!({ "path": "notes.txt" }).to_string())],
            ),
            TurnRecord::tool_result("c1", "read_file", true, "hi"),
            TurnRecord::assistant("The file says hi."),
        ]
    );

    // The second model call saw the tool result, behind the system prompt.
    let second = &provider.requests()[1];
    assert_eq!(second.messages[0], TurnRecord::system("You are a test agent."));
    assert_eq!(second.messages.len(), 4);
    assert!(second.tools.iter().any(|t| t.name == "read_file"));
    assert!(second.tools.iter().any(|t| t.name == "todo_write"));
}

#[tokio::test]
async fn local_tool_and_history_restore_across_reconnect() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        calls(
            "c1",
            "todo_write",
            json!({ "todos": [{ "content": "Say hello", "status": "in_progress" }] }),
        ),
        text("Planned."),
        text("Still here."),
    ]));
    let server = start_server(provider.clone()).await;

    let mut socket = connect(&server, "s2").await;
    send(&mut socket, user_message("s2", "r1", "make a plan", json!([]))).await;
    let frames = recv_until(&mut socket, "AGENT_COMPLETE").await;
    // Local tools never reach the client.
    assert!(!frames.iter().any(|f| f["type"] == "AGENT_TOOL_CALL_REQUEST"));
    assert!(
        frames
            .iter()
            .any(|f| f["type"] == "AGENT_PROMPT" && f["data"]["prompt_type"] == "TOOL_COMPLETE")
    );

    // Reconnect without waiting for the store to catch up.
    socket.close(None).await.unwrap();
    for _ in 0..500 {
        if server.runtime.session("s2").is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(server.runtime.session("s2").is_none());

    let mut socket = connect(&server, "s2").await;
    send(&mut socket, user_message("s2", "r2", "are you there?", json!([]))).await;
    let complete = recv_until(&mut socket, "AGENT_COMPLETE").await.pop().unwrap();
    assert_eq!(complete["content"], "Still here.");

    // system + restored 4 + new user message
    let third = &provider.requests()[2];
    assert_eq!(third.messages.len(), 6);
    assert_eq!(third.messages[1], TurnRecord::user("make a plan"));
    assert!(third.messages[3].content().contains("[~] Say hello"));
    assert_eq!(third.messages[5], TurnRecord::user("are you there?"));

    let records = wait_for_records(&server.store, "s2", 6).await;
    assert_eq!(records[5], TurnRecord::assistant("Still here."));
}

#[tokio::test]
async fn interrupt_over_websocket() {
    let provider = Arc::new(ScriptedProvider::new(vec![None]));
    let server = start_server(provider).await;
    let mut socket = connect(&server, "s3").await;

    send(&mut socket, user_message("s3", "r1", "think forever", json!([]))).await;
    recv_until(&mut socket, "AGENT_PROMPT").await;

    send(
        &mut socket,
        json!({ "type": "INTERRUPT", "session_code": "s3", "request_id": "r1" }),
    )
    .await;
    let complete = recv_until(&mut socket, "AGENT_COMPLETE").await.pop().unwrap();
    assert_eq!(complete["data"]["outcome"], "interrupted");

    let session = server.runtime.session("s3").unwrap();
    assert!(!session.is_running());
    assert_eq!(session.memory().len(), 1);
}

#[tokio::test]
async fn ping_and_invalid_frames() {
    let server = start_server(Arc::new(ScriptedProvider::new(vec![]))).await;
    let mut socket = connect(&server, "s4").await;

    send(
        &mut socket,
        json!({ "type": "PING", "session_code": "s4", "request_id": "p1" }),
    )
    .await;
    let pong = recv(&mut socket).await;
    assert_eq!(pong["type"], "PONG");
    assert_eq!(pong["request_id"], "p1");

    send(&mut socket, json!({ "type": "USER_MESSAGE", "session_code": "s4", "content": "hi" })).await;
    let error = recv(&mut socket).await;
    assert_eq!(error["type"], "AGENT_PROMPT");
    assert_eq!(error["data"]["prompt_type"], "ERROR");

    send(&mut socket, json!({ "type": "TELEPORT", "session_code": "s4", "request_id": "x" })).await;
    let error = recv(&mut socket).await;
    assert_eq!(error["data"]["prompt_type"], "ERROR");

    // Connection is still usable.
    send(
        &mut socket,
        json!({ "type": "PING", "session_code": "s4", "request_id": "p2" }),
    )
    .await;
    assert_eq!(recv(&mut socket).await["type"], "PONG");
}

#[tokio::test]
async fn model_failure_reports_failed_outcome() {
    let server = start_server(Arc::new(ScriptedProvider::new(vec![]))).await;
    let mut socket = connect(&server, "s5").await;

    send(&mut socket, user_message("s5", "r1", "hello", json!([]))).await;
    let frames = recv_until(&mut socket, "AGENT_COMPLETE").await;
    assert!(
        frames
            .iter()
            .any(|f| f["type"] == "AGENT_PROMPT" && f["data"]["prompt_type"] == "ERROR")
    );
    let complete = frames.last().unwrap();
    assert_eq!(complete["data"]["outcome"], "failed");
    assert!(complete["data"]["reason"].as_str().unwrap().contains("script exhausted"));
}
