//! Application state shared across handlers.

use std::sync::Arc;

use scout_agents::{Session, StreamingGateway};
use scout_runtime::Model;
use scout_sampling::SamplerConfig;
use scout_tokenizer::{ChatTemplate, TokenizerError};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::session_manager::SessionManager;

#[derive(Clone)]
pub struct AppState {
    /// The loaded model. Every session shares it; generation calls are
    /// serialized by the model itself.
    pub model: Model,
    /// Template resolved once against the model's vocabulary.
    pub template: ChatTemplate,
    /// Model name reported in API responses.
    pub model_name: String,
    pub config: Arc<ServerConfig>,
    pub sessions: Arc<SessionManager>,
    pub gateway: StreamingGateway,
}

impl AppState {
    pub fn new(model: Model, config: ServerConfig) -> Result<Self, TokenizerError> {
        let template = config.template.resolve(model.codec().as_ref())?;
        let model_name = config
            .model_name
            .clone()
            .unwrap_or_else(|| model.info().name.clone());
        let sessions = SessionManager::new(config.max_concurrent_turns, config.max_sessions);
        let gateway = StreamingGateway::new(config.gateway);
        Ok(Self {
            model,
            template,
            model_name,
            config: Arc::new(config),
            sessions,
            gateway,
        })
    }

    /// A fresh session on the shared model.
    pub fn new_session(
        &self,
        system: Option<String>,
        sampler: SamplerConfig,
    ) -> Result<Session, ServerError> {
        sampler
            .validate()
            .map_err(|e| ServerError::InvalidRequest(e.to_string()))?;
        let mut session =
            Session::new(self.model.clone(), self.template.clone()).with_sampler(sampler)?;
        if let Some(system) = system {
            session = session.with_system(system)?;
        }
        Ok(session)
    }
}
