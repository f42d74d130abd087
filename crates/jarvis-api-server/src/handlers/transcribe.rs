use axum::{
    extract::{Multipart, State},
    Json,
};
use bytes::Bytes;
use tracing::{debug, info};

use crate::models::chat::TranscriptionResponse;
use crate::security::{sanitize_file_name, sanitize_prompt};
use crate::state::AppState;
use crate::utils::error::ApiError;

const DEFAULT_FILE_NAME: &str = "audio.webm";

struct AudioUpload {
    file_name: String,
    data: Bytes,
}

fn is_audio_content_type(content_type: &str) -> bool {
    content_type.contains("audio") || content_type.contains("webm")
}

async fn read_audio_field(multipart: &mut Multipart) -> Result<AudioUpload, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name != "audio" && name != "file" {
            debug!(field = %name, "Skipping multipart field");
            continue;
        }

        if let Some(content_type) = field.content_type() {
            if !is_audio_content_type(content_type) {
                return Err(ApiError::BadRequest(
                    "Invalid file type. Please provide an audio file.".to_string(),
                ));
            }
        }

        let file_name = sanitize_file_name(field.file_name().unwrap_or_default(), DEFAULT_FILE_NAME);
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Failed to read audio: {}", e)))?;

        return Ok(AudioUpload { file_name, data });
    }

    Err(ApiError::BadRequest("No audio file provided".to_string()))
}

/// POST /api/transcribe
///
/// Multipart upload with an `audio` field, answered with `{ "text": ... }`
pub async fn transcribe_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<TranscriptionResponse>, ApiError> {
    let upload = read_audio_field(&mut multipart).await?;

    if upload.data.is_empty() {
        return Err(ApiError::BadRequest("Audio file is empty".to_string()));
    }

    let max_bytes = state.settings.server.transcribe_body_limit_bytes;
    if upload.data.len() > max_bytes {
        return Err(ApiError::BadRequest(format!(
            "File too large. Maximum size is {}MB.",
            max_bytes / (1024 * 1024)
        )));
    }

    info!(
        file_name = %upload.file_name,
        bytes = upload.data.len(),
        "Transcription request"
    );

    let text = state
        .gateway
        .execute_with_retry("transcribe", |client| {
            let audio = upload.data.clone();
            let file_name = upload.file_name.clone();
            async move { client.transcribe(audio, file_name).await }
        })
        .await?;

    // Silence transcribes to nothing, which is a valid result
    let text = sanitize_prompt(&text, state.settings.security.max_prompt_chars).unwrap_or_default();

    Ok(Json(TranscriptionResponse { text }))
}
