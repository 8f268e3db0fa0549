//! HTTP request handlers for API endpoints.

pub mod chat;
pub mod health;
pub mod sessions;

pub use chat::handle_chat_completion;
pub use health::handle_health;
pub use sessions::{create_session, delete_session, get_session, post_message};
