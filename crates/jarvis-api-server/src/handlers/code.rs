use axum::{extract::State, Json};
use tracing::info;

use crate::models::chat::{ChatCompletion, ChatMessage, ChatRequest};
use crate::models::code::{
    CodeRequest, ExplainCodeResponse, GenerateCodeRequest, GenerateCodeResponse,
    RefactorCodeResponse, ReviewCodeResponse,
};
use crate::security::sanitize_prompt;
use crate::state::AppState;
use crate::utils::error::ApiError;

const GENERATE_SYSTEM: &str =
    "You are an expert programmer. Generate clean, efficient, well-documented code.";
const EXPLAIN_SYSTEM: &str =
    "You are an expert code reviewer and educator. Explain code clearly and thoroughly.";
const REFACTOR_SYSTEM: &str = "You are an expert software engineer specializing in code \
refactoring. Provide improved code with clear explanations of changes.";
const REVIEW_SYSTEM: &str = "You are a senior code reviewer. Provide constructive, detailed \
feedback on code quality, security, and best practices.";

/// Generation runs cooler than the conversational default
const GENERATE_TEMPERATURE: f32 = 0.3;

fn require(value: &str, field: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!(
            "{} is required and must be a string",
            field
        )));
    }
    Ok(())
}

fn fenced(language: &str, code: &str) -> String {
    format!("```{}\n{}\n```", language, code)
}

/// One stateless system + user exchange through the gateway
async fn complete(
    state: &AppState,
    label: &'static str,
    system: &str,
    prompt: &str,
    temperature: Option<f32>,
) -> Result<ChatCompletion, ApiError> {
    let prompt = sanitize_prompt(prompt, state.settings.security.max_prompt_chars)?;

    let mut request = ChatRequest::new(vec![ChatMessage::system(system), ChatMessage::user(prompt)]);
    if let Some(temperature) = temperature {
        request = request.temperature(temperature);
    }

    let completion = state
        .gateway
        .execute_with_retry(label, |client| {
            let request = request.clone();
            async move { client.chat(request).await }
        })
        .await?;

    info!(
        operation = label,
        total_tokens = completion.usage.total_tokens,
        "Code request completed"
    );
    Ok(completion)
}

/// POST /api/code/generate
pub async fn generate_handler(
    State(state): State<AppState>,
    Json(request): Json<GenerateCodeRequest>,
) -> Result<Json<GenerateCodeResponse>, ApiError> {
    require(&request.description, "Description")?;

    let prompt = format!(
        "Generate {} code for the following:\n\n{}\n\n\
         Provide clean, well-documented code with comments explaining key parts.",
        request.language, request.description
    );
    let completion = complete(
        &state,
        "code_generate",
        GENERATE_SYSTEM,
        &prompt,
        Some(GENERATE_TEMPERATURE),
    )
    .await?;

    Ok(Json(GenerateCodeResponse {
        code: completion.content,
        language: request.language,
        usage: completion.usage,
    }))
}

/// POST /api/code/explain
pub async fn explain_handler(
    State(state): State<AppState>,
    Json(request): Json<CodeRequest>,
) -> Result<Json<ExplainCodeResponse>, ApiError> {
    require(&request.code, "Code")?;

    let prompt = format!(
        "Explain the following {} code:\n\n{}\n\n\
         Cover what the code does, its key functions or types, notable patterns, \
         and any potential issues or improvements.",
        request.language,
        fenced(&request.language, &request.code)
    );
    let completion = complete(&state, "code_explain", EXPLAIN_SYSTEM, &prompt, None).await?;

    Ok(Json(ExplainCodeResponse {
        explanation: completion.content,
        usage: completion.usage,
    }))
}

/// POST /api/code/refactor
pub async fn refactor_handler(
    State(state): State<AppState>,
    Json(request): Json<CodeRequest>,
) -> Result<Json<RefactorCodeResponse>, ApiError> {
    require(&request.code, "Code")?;

    let mut prompt = format!(
        "Refactor the following {} code to improve readability, performance, and \
         maintainability:\n\n{}\n",
        request.language,
        fenced(&request.language, &request.code)
    );
    if let Some(focus) = request.suggestion.as_deref().filter(|s| !s.trim().is_empty()) {
        prompt.push_str(&format!("\nSpecific focus: {}", focus));
    }
    let completion = complete(&state, "code_refactor", REFACTOR_SYSTEM, &prompt, None).await?;

    Ok(Json(RefactorCodeResponse {
        refactored_code: completion.content,
        usage: completion.usage,
    }))
}

/// POST /api/code/review
pub async fn review_handler(
    State(state): State<AppState>,
    Json(request): Json<CodeRequest>,
) -> Result<Json<ReviewCodeResponse>, ApiError> {
    require(&request.code, "Code")?;

    let prompt = format!(
        "Review the following {} code and provide detailed feedback:\n\n{}\n\n\
         Analyze code quality, potential bugs, security concerns, performance, \
         and suggestions for improvement.",
        request.language,
        fenced(&request.language, &request.code)
    );
    let completion = complete(&state, "code_review", REVIEW_SYSTEM, &prompt, None).await?;

    Ok(Json(ReviewCodeResponse {
        review: completion.content,
        usage: completion.usage,
    }))
}
