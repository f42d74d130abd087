pub mod chat;
pub mod code;
pub mod config;
pub mod health;
pub mod transcribe;
