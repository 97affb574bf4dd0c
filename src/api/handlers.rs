//! HTTP request handlers

use super::assets::{get_index_html, serve_static};
use super::session::Session;
use super::sse::{reply_sse, ReplyEvent};
use super::types::{
    ChatListResponse, ChatResponse, ChatWithMessagesResponse, ErrorResponse, SendMessageRequest,
    SuccessResponse,
};
use super::AppState;
use crate::db::Chat;
use crate::engine::{ConversationEngine, MessageSink};
use crate::llm::Role;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(serve_ui))
        .route("/assets/*path", get(serve_static))
        .route("/api/chats", get(list_chats))
        .route("/api/chats/new", post(create_chat))
        .route("/api/chats/:id", get(get_chat))
        .route("/api/chats/:id/delete", post(delete_chat))
        .route("/api/chats/:id/chat", post(send_chat))
        .route("/version", get(get_version))
        .with_state(state)
}

// ============================================================
// UI
// ============================================================

async fn serve_ui(session: Session) -> Response {
    let response = match get_index_html() {
        Some(content) => Html(content).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Html("<h1>404 - UI not found</h1>".to_string()),
        )
            .into_response(),
    };
    session.apply(response)
}

// ============================================================
// Chat CRUD
// ============================================================

async fn list_chats(State(state): State<AppState>, session: Session) -> Result<Response, AppError> {
    let chats = state
        .db
        .list_chats(&session.token)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(session.apply(Json(ChatListResponse { chats }).into_response()))
}

async fn create_chat(
    State(state): State<AppState>,
    session: Session,
) -> Result<Response, AppError> {
    let chat = state
        .db
        .create_chat(&session.token)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    tracing::info!(chat_id = %chat.id, "Created chat");
    Ok(session.apply(Json(ChatResponse { chat }).into_response()))
}

async fn get_chat(
    State(state): State<AppState>,
    session: Session,
    Path(id): Path<String>,
) -> Result<Json<ChatWithMessagesResponse>, AppError> {
    let chat = owned_chat(&state, &session, &id)?;

    let messages = state
        .db
        .get_chat_messages(&id)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(Json(ChatWithMessagesResponse { chat, messages }))
}

async fn delete_chat(
    State(state): State<AppState>,
    session: Session,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    owned_chat(&state, &session, &id)?;

    state
        .db
        .soft_delete_chat(&id)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    tracing::info!(chat_id = %id, "Soft-deleted chat");
    Ok(Json(SuccessResponse { success: true }))
}

// ============================================================
// Reply streaming
// ============================================================

async fn send_chat(
    State(state): State<AppState>,
    session: Session,
    Path(id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Response, AppError> {
    let chat = owned_chat(&state, &session, &id)?;

    if req.text.trim().is_empty() {
        return Err(AppError::BadRequest("Message text is empty".to_string()));
    }

    let messages = state
        .db
        .get_chat_messages(&id)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_reply(state, chat, messages, req.text, tx));

    Ok(session.apply(reply_sse(rx).into_response()))
}

/// Drive one full reply turn: lazily title the chat, stream the model's
/// answer into the SSE channel, and persist the assistant message once the
/// stream is drained. Runs on its own task so the SSE response can start
/// immediately.
async fn run_reply(
    state: AppState,
    chat: Chat,
    messages: Vec<crate::db::StoredMessage>,
    text: String,
    tx: mpsc::UnboundedSender<ReplyEvent>,
) {
    let sink: Arc<dyn MessageSink> = Arc::new(state.db.clone());
    let mut engine = ConversationEngine::new(
        chat.id.clone(),
        &messages,
        state.classifier.clone(),
        state.llm.clone(),
        Some(sink),
    );

    // Title is set lazily from the first message of the chat.
    if chat.title.is_none() {
        match engine.summarize_title(&text).await {
            Ok(title) if !title.is_empty() => {
                if let Err(e) = state.db.save_chat_title(&chat.id, &title) {
                    tracing::warn!(chat_id = %chat.id, error = %e, "Failed to save title");
                } else {
                    let _ = tx.send(ReplyEvent::Title { title });
                }
            }
            Ok(_) => {}
            Err(e) => {
                // A chat without a title is fine; the reply still runs.
                tracing::warn!(chat_id = %chat.id, error = %e.message, "Title generation failed");
            }
        }
    }

    let mut stream = match engine.reply(&text).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(chat_id = %chat.id, error = %e, "Reply failed to start");
            let _ = tx.send(ReplyEvent::Error {
                message: e.to_string(),
            });
            return;
        }
    };

    loop {
        match stream.next_fragment().await {
            Ok(Some(fragment)) => {
                if tx.send(ReplyEvent::Fragment { text: fragment }).is_err() {
                    // Client went away; stop pulling from the model.
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!(chat_id = %chat.id, error = %e.message, "Stream transport error");
                let _ = tx.send(ReplyEvent::Error {
                    message: e.message,
                });
                return;
            }
        }
    }

    let reply = stream.finish();
    let truncated = reply.outcome == crate::engine::ReplyOutcome::Truncated;

    if let Err(e) = state
        .db
        .append_message(&chat.id, Role::Assistant, &reply.text, None)
    {
        tracing::error!(chat_id = %chat.id, error = %e, "Failed to persist reply");
        let _ = tx.send(ReplyEvent::Error {
            message: e.to_string(),
        });
        return;
    }

    tracing::info!(
        chat_id = %chat.id,
        chars = reply.text.len(),
        truncated,
        "Reply complete"
    );
    let _ = tx.send(ReplyEvent::Done {
        text: reply.text,
        truncated,
    });
}

// ============================================================
// Version
// ============================================================

async fn get_version() -> &'static str {
    concat!("empath ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Helpers and error handling
// ============================================================

/// Fetch a chat and check it belongs to the requesting session. Absent,
/// soft-deleted, and foreign chats all look the same: not found.
fn owned_chat(state: &AppState, session: &Session, id: &str) -> Result<Chat, AppError> {
    state
        .db
        .get_chat(id)
        .map_err(|e| AppError::Internal(e.to_string()))?
        .filter(|chat| chat.session_id == session.token)
        .ok_or_else(|| AppError::NotFound(format!("Chat not found: {id}")))
}

enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::llm::{FragmentStream, GenRequest, GenerationService, LlmError, StreamEvent};
    use async_trait::async_trait;

    /// Scripted service covering both paths `run_reply` exercises: a fixed
    /// title completion and a fixed sequence of stream events.
    struct StubService {
        title: String,
        events: Vec<Result<StreamEvent, LlmError>>,
    }

    #[async_trait]
    impl GenerationService for StubService {
        async fn complete(&self, _request: &GenRequest) -> Result<String, LlmError> {
            Ok(self.title.clone())
        }

        async fn stream(&self, _request: &GenRequest) -> Result<FragmentStream, LlmError> {
            let events: Vec<_> = self
                .events
                .iter()
                .map(|e| match e {
                    Ok(ev) => Ok(ev.clone()),
                    Err(err) => Err(LlmError::new(err.kind, err.message.clone())),
                })
                .collect();
            Ok(Box::pin(futures::stream::iter(events)))
        }
    }

    /// Service whose stream never opens.
    struct FailingService;

    #[async_trait]
    impl GenerationService for FailingService {
        async fn complete(&self, _request: &GenRequest) -> Result<String, LlmError> {
            Ok(String::new())
        }

        async fn stream(&self, _request: &GenRequest) -> Result<FragmentStream, LlmError> {
            Err(LlmError::server_error("backend down"))
        }
    }

    fn state_with(llm: Arc<dyn GenerationService>) -> AppState {
        AppState::new(
            Database::open_in_memory().unwrap(),
            Arc::new(crate::emotion::tests::test_artifact()),
            llm,
        )
    }

    fn fragment(s: &str) -> Result<StreamEvent, LlmError> {
        Ok(StreamEvent::Fragment(s.to_string()))
    }

    async fn drain(mut rx: mpsc::UnboundedReceiver<ReplyEvent>) -> Vec<ReplyEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn reply_turn_persists_user_then_assistant_and_titles() {
        let service = Arc::new(StubService {
            title: "Output: A Heated Chat\n".to_string(),
            events: vec![fragment("Take a "), fragment("breath.")],
        });
        let state = state_with(service);
        let chat = state.db.create_chat("s1").unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        run_reply(
            state.clone(),
            chat.clone(),
            Vec::new(),
            "I am furious".to_string(),
            tx,
        )
        .await;
        let events = drain(rx).await;

        // First message of the chat: title generated, stripped, announced.
        assert!(matches!(&events[0], ReplyEvent::Title { title } if title == "A Heated Chat"));
        let titled = state.db.get_chat(&chat.id).unwrap().unwrap();
        assert_eq!(titled.title.as_deref(), Some("A Heated Chat"));

        let fragments: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ReplyEvent::Fragment { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(fragments, vec!["Take a ", "breath."]);

        match events.last().unwrap() {
            ReplyEvent::Done { text, truncated } => {
                assert_eq!(text, "Take a breath.");
                assert!(!truncated);
            }
            other => panic!("expected done, got {other:?}"),
        }

        // Both turns landed in the store, user row first.
        let messages = state.db.get_chat_messages(&chat.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "I am furious");
        assert!(messages[0]
            .prompt
            .as_deref()
            .unwrap()
            .starts_with("Message: I am furious"));
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Take a breath.");
        assert!(messages[0].timestamp <= messages[1].timestamp);
    }

    #[tokio::test]
    async fn titled_chat_does_not_regenerate_title() {
        let service = Arc::new(StubService {
            title: "Should Not Appear".to_string(),
            events: vec![fragment("ok")],
        });
        let state = state_with(service);
        let chat = state.db.create_chat("s1").unwrap();
        state.db.save_chat_title(&chat.id, "Existing").unwrap();
        let titled = state.db.get_chat(&chat.id).unwrap().unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        run_reply(state.clone(), titled, Vec::new(), "again".to_string(), tx).await;
        let events = drain(rx).await;

        assert!(!events
            .iter()
            .any(|e| matches!(e, ReplyEvent::Title { .. })));
        let chat = state.db.get_chat(&chat.id).unwrap().unwrap();
        assert_eq!(chat.title.as_deref(), Some("Existing"));
    }

    #[tokio::test]
    async fn safety_stop_persists_partial_reply_as_truncated() {
        let service = Arc::new(StubService {
            title: "Cut Short".to_string(),
            events: vec![fragment("partial"), Ok(StreamEvent::Blocked)],
        });
        let state = state_with(service);
        let chat = state.db.create_chat("s1").unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        run_reply(state.clone(), chat.clone(), Vec::new(), "hello".to_string(), tx).await;
        let events = drain(rx).await;

        match events.last().unwrap() {
            ReplyEvent::Done { text, truncated } => {
                assert_eq!(text, "partial");
                assert!(truncated);
            }
            other => panic!("expected done, got {other:?}"),
        }

        let messages = state.db.get_chat_messages(&chat.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "partial");
    }

    #[tokio::test]
    async fn failed_stream_start_reports_error_without_assistant_row() {
        let state = state_with(Arc::new(FailingService));
        let chat = state.db.create_chat("s1").unwrap();
        state.db.save_chat_title(&chat.id, "Existing").unwrap();
        let titled = state.db.get_chat(&chat.id).unwrap().unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        run_reply(state.clone(), titled, Vec::new(), "hello".to_string(), tx).await;
        let events = drain(rx).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ReplyEvent::Error { .. }));

        // The user turn was recorded before the stream failed to open; no
        // assistant row follows it.
        let messages = state.db.get_chat_messages(&chat.id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }
}
