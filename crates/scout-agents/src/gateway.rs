//! Incremental delivery of a turn to an async consumer.
//!
//! [`StreamingGateway::attach`] runs one turn on a blocking worker and
//! relays decoded fragments through a bounded channel. A slow consumer
//! stalls generation instead of growing a buffer; dropping the receiver or
//! calling [`Attachment::cancel`] stops generation at the next step.

use std::sync::Arc;

use futures::Stream;
use scout_engine::{EngineError, GenerationResult};
use scout_runtime::CancellationToken;
use scout_sampling::SamplerConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{PartialPolicy, Result, Session, SessionError};

/// A session shared between request handlers. Holding the lock is holding
/// the right to run a turn.
pub type SharedSession = Arc<Mutex<Session>>;

/// One event on an attachment, in generation order. Exactly one terminal
/// event (`Done` or `Error`) ends the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Fragment { index: u64, text: String },
    Done { result: GenerationResult },
    Error { message: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Fragment { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Fragments buffered ahead of the consumer.
    pub buffer: usize,
    pub partial: PartialPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            buffer: 16,
            partial: PartialPolicy::Discard,
        }
    }
}

/// A running turn.
pub struct Attachment {
    events: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
    handle: JoinHandle<Result<GenerationResult>>,
}

impl Attachment {
    /// Next event; `None` after the terminal event.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Stop generation at the next step boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Events as a stream. Dropping the stream cancels the turn.
    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let Attachment {
            mut events, cancel, ..
        } = self;
        let guard = cancel.drop_guard();
        async_stream::stream! {
            let _guard = guard;
            while let Some(event) = events.recv().await {
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    break;
                }
            }
        }
    }

    /// Wait for the turn to finish, discarding undelivered events.
    pub async fn finish(self) -> Result<GenerationResult> {
        let Attachment { events, handle, .. } = self;
        drop(events);
        handle.await.map_err(|e| {
            SessionError::Engine(EngineError::Inference(format!("turn worker failed: {e}")))
        })?
    }
}

#[derive(Debug, Clone, Copy)]
enum TurnKind {
    Continue,
    Reply,
}

/// Attaches consumers to session turns.
#[derive(Debug, Clone, Default)]
pub struct StreamingGateway {
    config: GatewayConfig,
}

impl StreamingGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Start a turn on `session` and return its event stream.
    ///
    /// Fails with [`SessionError::Busy`] if the session is already running
    /// a turn. Must be called from within a tokio runtime.
    pub fn attach(&self, session: SharedSession, sampler: Option<SamplerConfig>) -> Result<Attachment> {
        let guard = session.try_lock_owned().map_err(|_| SessionError::Busy)?;
        Ok(self.spawn_turn(guard, sampler, TurnKind::Continue))
    }

    /// Stream the reply to the message the caller just appended through
    /// `session`, whose lock it already holds. A failed or discarded turn
    /// removes that message again (see [`Session::reply_with`]).
    pub fn attach_reply(
        &self,
        session: OwnedMutexGuard<Session>,
        sampler: Option<SamplerConfig>,
    ) -> Attachment {
        self.spawn_turn(session, sampler, TurnKind::Reply)
    }

    fn spawn_turn(
        &self,
        mut guard: OwnedMutexGuard<Session>,
        sampler: Option<SamplerConfig>,
        kind: TurnKind,
    ) -> Attachment {
        let (tx, rx) = mpsc::channel(self.config.buffer.max(1));
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let policy = self.config.partial;

        let handle = tokio::task::spawn_blocking(move || {
            let mut index = 0u64;
            let on_fragment = |text: &str| {
                let event = StreamEvent::Fragment {
                    index,
                    text: text.to_string(),
                };
                index += 1;
                if tx.blocking_send(event).is_err() {
                    // Consumer went away.
                    worker_cancel.cancel();
                }
            };
            let result = match kind {
                TurnKind::Continue => guard.generate_turn_with(
                    sampler.as_ref(),
                    worker_cancel.clone(),
                    policy,
                    on_fragment,
                ),
                TurnKind::Reply => {
                    guard.reply_with(sampler.as_ref(), worker_cancel.clone(), policy, on_fragment)
                }
            };
            let terminal = match &result {
                Ok(result) => StreamEvent::Done {
                    result: result.clone(),
                },
                Err(e) => StreamEvent::Error {
                    message: e.to_string(),
                },
            };
            if tx.blocking_send(terminal).is_err() {
                debug!(session_id = %guard.id(), "consumer gone before terminal event");
            }
            result
        });

        Attachment {
            events: rx,
            cancel,
            handle,
        }
    }
}
