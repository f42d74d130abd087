use axum::{
    extract::{Path, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::StreamExt;
use serde::Serialize;
use std::convert::Infallible;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::models::chat::{
    ChatApiRequest, ChatApiResponse, ChatRequest, ConversationId, DeleteResponse, HistoryResponse,
    Role,
};
use crate::security::sanitize_prompt;
use crate::services::TextStream;
use crate::state::AppState;
use crate::utils::error::ApiError;

#[derive(Serialize)]
#[serde(untagged)]
enum StreamFrame<'a> {
    Chunk {
        chunk: &'a str,
    },
    Error {
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    Done {
        done: bool,
        conversation_id: &'a str,
    },
}

fn data_event<T: Serialize>(data: &T) -> Event {
    Event::default().data(serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string()))
}

/// POST /api/chat
///
/// Appends the user's message to a conversation (a new one seeded with the
/// system prompt when no id is given) and replies with the assistant's
/// answer, either as JSON or as an SSE stream.
pub async fn chat_handler(
    State(state): State<AppState>,
    Json(request): Json<ChatApiRequest>,
) -> Result<Response, ApiError> {
    let message = sanitize_prompt(&request.message, state.settings.security.max_prompt_chars)?;

    let conversation_id = match request.conversation_id {
        Some(id) if state.conversations.contains(&id) => id,
        Some(id) => return Err(ApiError::NotFound(format!("Conversation {} not found", id))),
        None => state
            .conversations
            .create(Some(&state.settings.llm.system_prompt)),
    };

    info!(
        conversation_id = %conversation_id,
        message_len = message.len(),
        stream = request.stream,
        "Chat request"
    );

    state
        .conversations
        .add_message(&conversation_id, Role::User, &message)?;
    let history = state.conversations.get_messages(&conversation_id)?;
    let upstream_request = ChatRequest::from_history(&history);

    if request.stream {
        let chunks = state
            .gateway
            .execute_with_retry("chat_stream", |client| {
                let request = upstream_request.clone();
                async move { client.chat_stream(request).await }
            })
            .await
            .inspect_err(|_| forget_turn(&state, &conversation_id, &message))?;
        let chunks = state.gateway.supervise_stream(chunks);
        return Ok(stream_reply(state, conversation_id, message, chunks).into_response());
    }

    let start_time = Instant::now();
    let completion = state
        .gateway
        .execute_with_retry("chat", |client| {
            let request = upstream_request.clone();
            async move { client.chat(request).await }
        })
        .await
        .inspect_err(|_| forget_turn(&state, &conversation_id, &message))?;

    remember_reply(&state, &conversation_id, &completion.content);

    info!(
        conversation_id = %conversation_id,
        total_tokens = completion.usage.total_tokens,
        elapsed_ms = start_time.elapsed().as_millis() as u64,
        "Chat completed"
    );

    Ok(Json(ChatApiResponse {
        conversation_id,
        message: completion.content,
        model: completion.model,
        usage: completion.usage,
    })
    .into_response())
}

fn stream_reply(
    state: AppState,
    conversation_id: ConversationId,
    user_message: String,
    mut chunks: TextStream,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        let mut full_response = String::new();

        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    full_response.push_str(&chunk);
                    yield Ok(data_event(&StreamFrame::Chunk { chunk: &chunk }));
                }
                Err(e) => {
                    error!(conversation_id = %conversation_id, error = %e, "Chat stream failed");
                    forget_turn(&state, &conversation_id, &user_message);
                    yield Ok(data_event(&StreamFrame::Error { error: e.to_string() }));
                    return;
                }
            }
        }

        remember_reply(&state, &conversation_id, &full_response);
        info!(
            conversation_id = %conversation_id,
            response_len = full_response.len(),
            "Chat stream completed"
        );

        yield Ok(data_event(&StreamFrame::Done {
            done: true,
            conversation_id: &conversation_id,
        }));
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Store the assistant's reply. The conversation may have been evicted
/// while the upstream call was in flight; the reply is still returned.
fn remember_reply(state: &AppState, conversation_id: &str, content: &str) {
    if content.is_empty() {
        return;
    }
    if let Err(e) = state
        .conversations
        .add_message(conversation_id, Role::Assistant, content)
    {
        warn!(conversation_id, error = %e, "Could not store assistant reply");
    }
}

/// Drop the user's turn when no reply was stored, so the next request does
/// not send two user turns in a row.
fn forget_turn(state: &AppState, conversation_id: &str, user_message: &str) {
    if state
        .conversations
        .retract_last(conversation_id, Role::User, user_message)
    {
        debug!(conversation_id, "Dropped unanswered user turn");
    }
}

/// GET /api/chat/{id}
pub async fn history_handler(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let messages = state
        .conversations
        .get_messages(&conversation_id)?
        .into_iter()
        .filter(|m| !m.is_system())
        .collect();

    Ok(Json(HistoryResponse {
        conversation_id,
        messages,
    }))
}

/// DELETE /api/chat/{id}
pub async fn delete_handler(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
) -> Json<DeleteResponse> {
    let deleted = state.conversations.delete(&conversation_id);
    info!(conversation_id = %conversation_id, deleted, "Conversation cleared");

    Json(DeleteResponse {
        message: "Conversation cleared".to_string(),
        deleted,
    })
}
