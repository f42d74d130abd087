use serde::{Deserialize, Serialize};

use crate::models::chat::TokenUsage;

fn default_language() -> String {
    "typescript".to_string()
}

#[derive(Debug, Deserialize)]
pub struct GenerateCodeRequest {
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_language")]
    pub language: String,
}

/// Body shared by explain, refactor and review
#[derive(Debug, Deserialize)]
pub struct CodeRequest {
    #[serde(default)]
    pub code: String,
    #[serde(default = "default_language")]
    pub language: String,
    /// Refactoring focus, ignored by the other routes
    #[serde(default)]
    pub suggestion: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GenerateCodeResponse {
    pub code: String,
    pub language: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Serialize)]
pub struct ExplainCodeResponse {
    pub explanation: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefactorCodeResponse {
    pub refactored_code: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Serialize)]
pub struct ReviewCodeResponse {
    pub review: String,
    pub usage: TokenUsage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_defaults_to_typescript() {
        let req: CodeRequest = serde_json::from_str(r#"{"code":"fn main() {}"}"#).unwrap();
        assert_eq!(req.language, "typescript");
        assert!(req.suggestion.is_none());

        let req: GenerateCodeRequest =
            serde_json::from_str(r#"{"description":"a parser","language":"rust"}"#).unwrap();
        assert_eq!(req.language, "rust");
    }
}
