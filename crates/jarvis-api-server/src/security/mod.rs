pub mod auth;
pub mod rate_limit;
pub mod sanitizer;

pub use auth::api_key_middleware;
pub use rate_limit::{client_identifier, rate_limit_middleware};
pub use sanitizer::{sanitize_file_name, sanitize_prompt};
