//! WebSocket Handler
//!
//! Live canvas surface for one conversation: commands in, results and
//! engine notifications out.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::CanvasNotification;
use crate::protocol::{CanvasCommand, ClientMessage, ServerMessage};
use crate::session::CanvasSessionManager;

/// Shared state for the WebSocket handler
#[derive(Debug, Clone)]
pub struct CanvasState {
    /// Session manager
    pub manager: Arc<CanvasSessionManager>,
}

impl CanvasState {
    /// Create a new canvas state
    #[must_use]
    pub fn new(manager: Arc<CanvasSessionManager>) -> Self {
        Self { manager }
    }
}

/// Router exposing `/api/v1/canvas/ws/:conversation_id`
pub fn canvas_router(state: Arc<CanvasState>) -> Router {
    Router::new()
        .route("/api/v1/canvas/ws/:conversation_id", get(canvas_ws_handler))
        .with_state(state)
}

/// WebSocket upgrade handler
pub async fn canvas_ws_handler(
    ws: WebSocketUpgrade,
    Path(conversation_id): Path<String>,
    State(state): State<Arc<CanvasState>>,
) -> impl IntoResponse {
    info!(conversation_id = %conversation_id, "WebSocket upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, conversation_id, state))
}

type Sender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, conversation_id: String, state: Arc<CanvasState>) {
    let connection_id = Uuid::new_v4();
    info!(
        conversation_id = %conversation_id,
        connection_id = %connection_id,
        "WebSocket connected"
    );

    let (sender, mut receiver) = socket.split();
    let sender: Sender = Arc::new(Mutex::new(sender));

    // Subscribe before switching so nothing published in between is missed
    let notifications = state.manager.subscribe();

    let welcome = match state.manager.switch_conversation(&conversation_id).await {
        Ok(_) => ServerMessage::Welcome {
            conversation_id: conversation_id.clone(),
            elements: state.manager.store().elements_for(&conversation_id, false),
        },
        Err(e) => ServerMessage::from_error(None, &e),
    };
    if let Err(e) = send_message(&sender, &welcome).await {
        error!(error = %e, "Failed to send welcome message");
        return;
    }

    let forward_handle = tokio::spawn(forward_notifications(
        notifications,
        conversation_id.clone(),
        Arc::clone(&sender),
    ));

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                debug!(connection_id = %connection_id, len = text.len(), "Received message");
                if let Some(reply) =
                    handle_client_message(&state.manager, &conversation_id, &text).await
                {
                    if let Err(e) = send_message(&sender, &reply).await {
                        warn!(error = %e, "Failed to send reply");
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) => {
                info!(connection_id = %connection_id, "WebSocket closed by client");
                break;
            }
            Ok(Message::Ping(data)) => {
                let _ = sender.lock().await.send(Message::Pong(data)).await;
            }
            Err(e) => {
                warn!(error = %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    forward_handle.abort();
    if let Err(e) = state.manager.save_conversation(&conversation_id).await {
        warn!(conversation_id = %conversation_id, error = %e, "failed to save snapshot on disconnect");
    }
    info!(connection_id = %connection_id, "WebSocket disconnected");
}

/// Whether a notification belongs on a connection bound to `conversation_id`
fn is_relevant(notification: &CanvasNotification, conversation_id: &str) -> bool {
    match notification {
        CanvasNotification::ConversationSwitched { .. } => true,
        other => other.conversation_id() == conversation_id,
    }
}

async fn forward_notifications(
    mut rx: broadcast::Receiver<CanvasNotification>,
    conversation_id: String,
    sender: Sender,
) {
    loop {
        match rx.recv().await {
            Ok(notification) => {
                if !is_relevant(&notification, &conversation_id) {
                    continue;
                }
                let msg = ServerMessage::Notification { notification };
                if send_message(&sender, &msg).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(lagged = n, conversation_id = %conversation_id, "WebSocket client lagged; notifications dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Send a server message
async fn send_message(sender: &Sender, message: &ServerMessage) -> Result<(), String> {
    let json = serde_json::to_string(message).map_err(|e| e.to_string())?;
    sender
        .lock()
        .await
        .send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}

/// Run one client message; returns the reply to send, if any
pub async fn handle_client_message(
    manager: &CanvasSessionManager,
    conversation_id: &str,
    text: &str,
) -> Option<ServerMessage> {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            return Some(ServerMessage::error(
                "invalid_message",
                format!("Invalid message: {e}"),
            ))
        }
    };

    match client_msg {
        ClientMessage::Ping => Some(ServerMessage::Pong),
        ClientMessage::Command {
            request_id,
            command,
        } => {
            // Commands over this connection address its conversation
            let command = match command {
                CanvasCommand::CreateElement {
                    conversation_id: None,
                    kind,
                    title,
                } => CanvasCommand::CreateElement {
                    conversation_id: Some(conversation_id.to_string()),
                    kind,
                    title,
                },
                CanvasCommand::ListElements {
                    conversation_id: None,
                    include_archived,
                } => CanvasCommand::ListElements {
                    conversation_id: Some(conversation_id.to_string()),
                    include_archived,
                },
                other => other,
            };
            let kind = command.kind();
            match manager.execute(command).await {
                Ok(outcome) => Some(ServerMessage::Result {
                    request_id,
                    outcome,
                }),
                Err(e) => {
                    debug!(command = kind, error = %e, "Command failed");
                    Some(ServerMessage::from_error(request_id, &e))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CanvasConfig;
    use crate::protocol::CommandOutcome;
    use crate::scheduler::ManualScheduler;

    fn manager() -> CanvasSessionManager {
        CanvasSessionManager::new(CanvasConfig::default(), Arc::new(ManualScheduler::new()))
    }

    #[tokio::test]
    async fn test_ping() {
        let reply = handle_client_message(&manager(), "conv", r#"{"type":"ping"}"#).await;
        assert!(matches!(reply, Some(ServerMessage::Pong)));
    }

    #[tokio::test]
    async fn test_invalid_message() {
        match handle_client_message(&manager(), "conv", "not json").await {
            Some(ServerMessage::Error { code, .. }) => assert_eq!(code, "invalid_message"),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_element_binds_to_connection_conversation() {
        let manager = manager();
        let text = r#"{"type":"command","request_id":"r1","command":{"type":"create_element","kind":{"type":"document"},"title":"Notes"}}"#;
        let reply = handle_client_message(&manager, "conv-7", text).await;

        let Some(ServerMessage::Result {
            request_id,
            outcome: CommandOutcome::ElementCreated { element_id },
        }) = reply
        else {
            panic!("expected ElementCreated, got {reply:?}");
        };
        assert_eq!(request_id.as_deref(), Some("r1"));
        let element = manager.store().get_element(element_id).unwrap();
        assert_eq!(element.conversation_id, "conv-7");
    }

    #[tokio::test]
    async fn test_list_elements_uses_connection_conversation() {
        let manager = manager();
        manager.switch_conversation("a").await.unwrap();

        let create = r#"{"type":"command","command":{"type":"create_element","kind":{"type":"document"},"title":"Notes"}}"#;
        handle_client_message(&manager, "b", create).await;

        let list = r#"{"type":"command","request_id":"r2","command":{"type":"list_elements"}}"#;
        match handle_client_message(&manager, "b", list).await {
            Some(ServerMessage::Result {
                outcome: CommandOutcome::Elements { elements },
                ..
            }) => {
                assert_eq!(elements.len(), 1);
                assert_eq!(elements[0].conversation_id, "b");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert_eq!(manager.active_conversation().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_command_error_carries_request_id() {
        let text = format!(
            r#"{{"type":"command","request_id":"r9","command":{{"type":"skip","element_id":"{}"}}}}"#,
            Uuid::new_v4()
        );
        match handle_client_message(&manager(), "conv", &text).await {
            Some(ServerMessage::Error {
                request_id, code, ..
            }) => {
                assert_eq!(request_id.as_deref(), Some("r9"));
                assert_eq!(code, "element_not_found");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn test_notification_filtering() {
        let own = CanvasNotification::AllRevealsComplete {
            conversation_id: "a".to_string(),
        };
        let other = CanvasNotification::AllRevealsComplete {
            conversation_id: "b".to_string(),
        };
        let switched = CanvasNotification::ConversationSwitched {
            previous: Some("a".to_string()),
            conversation_id: "b".to_string(),
        };
        assert!(is_relevant(&own, "a"));
        assert!(!is_relevant(&other, "a"));
        assert!(is_relevant(&switched, "a"));
    }
}
