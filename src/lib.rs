//! botmon-chatbot
//!
//! Chatbot test console for Botmon merchants: rebuilds a trigger -> response
//! flow table from a store's chat history and answers test messages through
//! the remote test-chat endpoint, falling back to the local flow table.

pub mod app;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod flows;
pub mod prompting;
pub mod resolver;
pub mod session;
pub mod types;

use chrono::Utc;

pub(crate) fn now_iso() -> String {
    Utc::now().to_rfc3339()
}
