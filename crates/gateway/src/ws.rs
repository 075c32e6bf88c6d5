//! `GET /v1/ws?session=<code>` — one agent session per connection.
//!
//! The receive loop only admits runs and routes replies; executions run on
//! their own tasks. Everything the agent publishes for this session is
//! translated to frames and queued to a writer task that owns the socket
//! sink. When the socket goes away the session is closed.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use clawlink_agent::{Admission, AgentRuntime};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::SharedState;
use crate::protocol::{Frame, FrameType, ToolCallResponseData, UserMessageData};

#[derive(Deserialize)]
pub(crate) struct WsParams {
    session: String,
}

pub(crate) async fn ws_handler(
    Query(params): Query<WsParams>,
    State(state): State<SharedState>,
    ws: WebSocketUpgrade,
) -> Response {
    let session_code = params.session.trim().to_string();
    if session_code.is_empty() {
        return (StatusCode::BAD_REQUEST, "session must not be empty").into_response();
    }
    ws.on_upgrade(move |socket| handle_connection(socket, state, session_code))
}

async fn handle_connection(socket: WebSocket, state: SharedState, session_code: String) {
    let runtime = &state.runtime;
    runtime.open_session(&session_code).await;
    info!(session_id = %session_code, "WebSocket connection established");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let outbound = tx.clone();
    let code = session_code.clone();
    let subscription = runtime.subscribe_all(move |event| {
        if event.session_id() != code {
            return Ok(());
        }
        if let Some(frame) = Frame::from_event(event) {
            outbound
                .send(frame)
                .map_err(|_| clawlink_core::Error::Internal(format!("connection for '{code}' is gone")))?;
        }
        Ok(())
    });

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        if let Some(reply) = handle_frame(runtime, &session_code, text.as_str()).await {
            if tx.send(reply).is_err() {
                break;
            }
        }
    }

    runtime.unsubscribe(subscription);
    runtime.close_session(&session_code);
    drop(tx);
    let _ = writer.await;
    info!(session_id = %session_code, "WebSocket connection closed");
}

/// Act on one inbound frame. Returns the direct reply, if any.
///
/// Never waits on an execution: runs are spawned by the runtime and their
/// output reaches the client through the event subscription.
pub(crate) async fn handle_frame(runtime: &AgentRuntime, session_code: &str, text: &str) -> Option<Frame> {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => return Some(Frame::error(session_code, "", format!("Invalid frame: {e}"))),
    };
    if frame.session_code.is_empty() || frame.request_id.is_empty() {
        return Some(Frame::error(
            session_code,
            &frame.request_id,
            "Frame is missing session_code or request_id",
        ));
    }
    if frame.session_code != session_code {
        return Some(Frame::error(
            session_code,
            &frame.request_id,
            format!("Frame is for session '{}', not this connection", frame.session_code),
        ));
    }
    let request_id = frame.request_id.as_str();

    match frame.frame_type {
        FrameType::Ping => Some(Frame::new(FrameType::Pong, session_code, request_id)),

        FrameType::UserMessage => {
            let data: UserMessageData = match frame.data_as() {
                Ok(data) => data,
                Err(e) => return Some(Frame::error(session_code, request_id, format!("Invalid data: {e}"))),
            };
            // Re-attach if an idle sweep closed the session under us.
            runtime.open_session(session_code).await;
            let input = data.into_run_input(frame.content.clone().unwrap_or_default());
            match runtime.begin_run(session_code, request_id, input) {
                Ok(Admission::Accepted(handle)) => {
                    debug!(execution = %handle.id(), "Run accepted");
                    None
                }
                Ok(Admission::Busy) => Some(Frame::error(
                    session_code,
                    request_id,
                    "Agent is busy with another request",
                )),
                Err(e) => Some(Frame::error(session_code, request_id, e.to_string())),
            }
        }

        FrameType::AgentToolCallResponse => {
            let data: ToolCallResponseData = match frame.data_as() {
                Ok(data) => data,
                Err(e) => return Some(Frame::error(session_code, request_id, format!("Invalid data: {e}"))),
            };
            let call_id = data.tool_call_id.clone();
            if !runtime.submit_tool_result(session_code, request_id, &call_id, data.into_response()) {
                debug!(session_id = session_code, request_id, tool_call_id = %call_id, "Late tool response ignored");
            }
            None
        }

        FrameType::Interrupt => {
            runtime.interrupt(session_code);
            None
        }

        other => Some(Frame::error(
            session_code,
            request_id,
            format!("Unexpected frame type from client: {other:?}"),
        )),
    }
}
