//! Token estimation for chat context budgeting
//! Rough rule: ~4 characters per token

const CHARS_PER_TOKEN: usize = 4;

/// Estimate tokens from text length, rounding up
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}
