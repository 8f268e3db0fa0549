//! # scout-server
//!
//! HTTP surface for scout.
//!
//! Two families of endpoints share one loaded [`scout_runtime::Model`]:
//! - `/v1/sessions`: server-held conversations. Each turn is streamed as
//!   Server-Sent Events (`fragment` events with increasing ids, then one
//!   `done` or `error` event). Disconnecting cancels the turn.
//! - `/v1/chat/completions`: stateless, OpenAI-compatible completions,
//!   streaming or not.

pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod server;
pub mod session_manager;
pub mod state;
pub mod streaming;

pub use config::ServerConfig;
pub use error::ServerError;
pub use server::{create_router, run_server};
pub use session_manager::SessionManager;
pub use state::AppState;
