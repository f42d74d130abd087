//! Conversation memory management module
//!
//! In-memory conversation state keyed by conversation id, with a per-entry
//! token budget, a population cap and idle expiry.

mod store;
mod types;

pub use store::ConversationStore;
pub use types::{Conversation, ConversationStats};
