use once_cell::sync::Lazy;
use regex::Regex;

use crate::utils::error::CoreError;

/// Control characters except newline and tab (NUL included)
static CONTROL_CHARS: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"[\x00-\x08\x0B-\x1F\x7F]").ok());

/// Path separators and characters reserved on common filesystems
static UNSAFE_FILE_CHARS: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#"[/\\<>:"|?*\x00-\x1F]"#).ok());

const MAX_FILE_NAME_CHARS: usize = 255;

fn strip(pattern: &Lazy<Option<Regex>>, input: &str, is_unsafe: fn(char) -> bool) -> String {
    match pattern.as_ref() {
        Some(re) => re.replace_all(input, "").into_owned(),
        None => input.chars().filter(|c| !is_unsafe(*c)).collect(),
    }
}

fn is_stripped_control(c: char) -> bool {
    c.is_ascii_control() && c != '\n' && c != '\t'
}

fn is_unsafe_file_char(c: char) -> bool {
    c.is_ascii_control() || matches!(c, '/' | '\\' | '<' | '>' | ':' | '"' | '|' | '?' | '*')
}

/// Scrub user text before it enters a conversation.
///
/// Strips control characters (keeping `\n` and `\t`), caps the result at
/// `max_chars` characters and trims surrounding whitespace. Text that is
/// empty afterwards is rejected.
pub fn sanitize_prompt(input: &str, max_chars: usize) -> Result<String, CoreError> {
    let cleaned = strip(&CONTROL_CHARS, input, is_stripped_control);
    let capped: String = cleaned.chars().take(max_chars).collect();
    let trimmed = capped.trim();

    if trimmed.is_empty() {
        return Err(CoreError::InvalidInput("Message cannot be empty".to_string()));
    }

    Ok(trimmed.to_string())
}

/// Reduce an uploaded file name to a single safe path component
pub fn sanitize_file_name(name: &str, fallback: &str) -> String {
    let cleaned = strip(&UNSAFE_FILE_CHARS, name, is_unsafe_file_char).replace("..", "");
    let capped: String = cleaned.trim().chars().take(MAX_FILE_NAME_CHARS).collect();

    if capped.is_empty() {
        fallback.to_string()
    } else {
        capped
    }
}
