//! The autonomous coding loop.
//!
//! One call to [`ScriptExecutor::run`] drives a bounded state machine:
//!
//! ```text
//! AwaitModelOutput -> ScriptExtracted -> Executing -> ContinueRequested -> AwaitModelOutput
//!                  \                             \-> Exception         -> AwaitModelOutput
//!                   \-> TerminalNoScript          \-> TerminalSuccess
//! ```
//!
//! Exceptions and continuation requests share one retry budget
//! (`max_attempts`), so the loop runs at most `max_attempts + 1` model turns
//! for any sequence of failing scripts. Sandbox violations are budgeted
//! separately against the same bound.

use std::fmt;
use std::time::Duration;

use scout_engine::Message;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::runner::{PythonRunner, RunStatus, SandboxPolicy, ScriptRun, ScriptRunner};
use crate::script::{coding_preamble, extract_script, strip_sentinel};
use crate::{Result, Session};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_SENTINEL: &str = "CONTINUE";
pub const EXCEPTION_PREFIX: &str = "PREVIOUS SCRIPT EXCEPTION: ";
pub const OUTPUT_PREFIX: &str = "LAST SCRIPT OUTPUT: ";

/// Loop configuration. The feedback prefixes are the contract with prompt
/// templates that expect them; change them only together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Corrective retries after the first model turn.
    pub max_attempts: u32,
    /// Wall-clock limit per script run.
    #[serde(with = "seconds")]
    pub timeout: Duration,
    pub continuation_sentinel: String,
    pub exception_prefix: String,
    pub output_prefix: String,
    /// Interpreter for [`PythonRunner`].
    pub python: String,
    pub sandbox: SandboxPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout: Duration::from_secs(10),
            continuation_sentinel: DEFAULT_SENTINEL.to_string(),
            exception_prefix: EXCEPTION_PREFIX.to_string(),
            output_prefix: OUTPUT_PREFIX.to_string(),
            python: "python3".to_string(),
            sandbox: SandboxPolicy::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.continuation_sentinel = sentinel.into();
        self
    }

    /// The runner this configuration describes.
    pub fn python_runner(&self) -> PythonRunner {
        PythonRunner::new(&self.python).with_policy(self.sandbox)
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// States of the loop, reported through tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    AwaitModelOutput,
    ScriptExtracted,
    Executing,
    ContinueRequested,
    Exception,
    TerminalSuccess,
    TerminalNoScript,
    TerminalFailure,
}

/// One script attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptExecutionRecord {
    pub source: String,
    pub stdout: String,
    pub exception: Option<String>,
    /// Zero-based model turn that produced the script.
    pub attempt: usize,
    pub continue_requested: bool,
}

/// How the loop ended. Every variant other than `Success` and `NoScript`
/// is a failure the caller should surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScriptOutcome {
    /// The last script ran cleanly; its output is the answer.
    Success { stdout: String },
    /// The model answered without a script; its text is the answer.
    NoScript { text: String },
    /// The retry budget ran out. Carries the last exception (or, for a
    /// final continuation request, the last output).
    AttemptsExhausted { last_error: String },
    /// The last attempt hit the wall-clock limit.
    Timeout { partial_stdout: String },
    /// The interpreter could not be started.
    SpawnFailed { error: String },
    /// The script kept attempting blocked operations.
    SandboxViolation { detail: String },
}

impl ScriptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ScriptOutcome::Success { .. } | ScriptOutcome::NoScript { .. })
    }
}

/// Result of one [`ScriptExecutor::run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub outcome: ScriptOutcome,
    /// The final attempt, if any script ran.
    pub record: Option<ScriptExecutionRecord>,
    /// Model turns generated during the run.
    pub model_turns: usize,
}

impl fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.model_turns;
        match &self.outcome {
            ScriptOutcome::Success { stdout } => f.write_str(stdout.trim_end()),
            ScriptOutcome::NoScript { text } => f.write_str(text.trim_end()),
            ScriptOutcome::AttemptsExhausted { last_error } => {
                write!(f, "script failed after {n} attempts:\n{last_error}")
            }
            ScriptOutcome::Timeout { partial_stdout } => {
                write!(f, "script timed out after {n} attempts")?;
                if !partial_stdout.trim().is_empty() {
                    write!(f, "; partial output:\n{}", partial_stdout.trim_end())?;
                }
                Ok(())
            }
            ScriptOutcome::SpawnFailed { error } => {
                write!(f, "could not start the interpreter: {error}")
            }
            ScriptOutcome::SandboxViolation { detail } => {
                write!(f, "script blocked by sandbox after {n} attempts: {detail}")
            }
        }
    }
}

/// Drives the generate, execute, feed-back loop on a [`Session`].
pub struct ScriptExecutor<R: ScriptRunner = PythonRunner> {
    config: ExecutorConfig,
    runner: R,
}

impl ScriptExecutor<PythonRunner> {
    pub fn new(config: ExecutorConfig) -> Self {
        let runner = config.python_runner();
        Self { config, runner }
    }
}

impl<R: ScriptRunner> ScriptExecutor<R> {
    pub fn with_runner(config: ExecutorConfig, runner: R) -> Self {
        Self { config, runner }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Install the coding persona as the session's system preamble.
    pub fn prepare(&self, session: &mut Session) -> Result<()> {
        session.set_preamble(coding_preamble(&self.config))
    }

    /// Append `request` as a user message and run the loop to a terminal
    /// state. Session and model errors are returned as `Err`; everything
    /// that happens to scripts is reported in the [`ExecutionReport`].
    pub async fn run(&self, session: &mut Session, request: &str) -> Result<ExecutionReport> {
        session.append(Message::user(request))?;

        let max = self.config.max_attempts as usize;
        let mut retries = 0usize;
        let mut violations = 0usize;
        let mut turns = 0usize;
        let mut state = ExecutorState::AwaitModelOutput;

        loop {
            debug!(session_id = %session.id(), ?state, turn = turns, "awaiting model output");
            let turn = generate_blocking(session)?;
            turns += 1;

            let Some(source) = extract_script(&turn.text) else {
                self.transition(&mut state, ExecutorState::TerminalNoScript, turns);
                return Ok(ExecutionReport {
                    outcome: ScriptOutcome::NoScript { text: turn.text },
                    record: None,
                    model_turns: turns,
                });
            };
            self.transition(&mut state, ExecutorState::ScriptExtracted, turns);
            self.transition(&mut state, ExecutorState::Executing, turns);

            let run = match self.runner.run(&source, self.config.timeout).await {
                Ok(run) => run,
                Err(e) => {
                    warn!(session_id = %session.id(), error = %e, "script runner failed");
                    self.transition(&mut state, ExecutorState::TerminalFailure, turns);
                    return Ok(ExecutionReport {
                        outcome: ScriptOutcome::SpawnFailed {
                            error: e.to_string(),
                        },
                        record: None,
                        model_turns: turns,
                    });
                }
            };

            let ScriptRun { status, stdout, .. } = run;
            let mut record = ScriptExecutionRecord {
                source,
                stdout,
                exception: None,
                attempt: turns - 1,
                continue_requested: false,
            };

            let (feedback, terminal) = match status {
                RunStatus::Completed => {
                    match strip_sentinel(&record.stdout, &self.config.continuation_sentinel) {
                        None => {
                            self.transition(&mut state, ExecutorState::TerminalSuccess, turns);
                            return Ok(ExecutionReport {
                                outcome: ScriptOutcome::Success {
                                    stdout: record.stdout.clone(),
                                },
                                record: Some(record),
                                model_turns: turns,
                            });
                        }
                        Some(output) => {
                            let output = output.to_string();
                            record.continue_requested = true;
                            self.transition(&mut state, ExecutorState::ContinueRequested, turns);
                            let feedback = format!("{}{}", self.config.output_prefix, output);
                            let terminal = ScriptOutcome::AttemptsExhausted {
                                last_error: format!(
                                    "continuation requested with no attempts left; last output: {output}"
                                ),
                            };
                            (feedback, terminal)
                        }
                    }
                }
                RunStatus::Raised(trace) => {
                    record.exception = Some(trace.clone());
                    self.transition(&mut state, ExecutorState::Exception, turns);
                    let feedback = format!("{}{}", self.config.exception_prefix, trace);
                    (feedback, ScriptOutcome::AttemptsExhausted { last_error: trace })
                }
                RunStatus::TimedOut => {
                    let message = format!(
                        "script timed out after {:.1}s",
                        self.config.timeout.as_secs_f64()
                    );
                    record.exception = Some(message.clone());
                    self.transition(&mut state, ExecutorState::Exception, turns);
                    let feedback = format!("{}{}", self.config.exception_prefix, message);
                    let terminal = ScriptOutcome::Timeout {
                        partial_stdout: record.stdout.clone(),
                    };
                    (feedback, terminal)
                }
                RunStatus::SandboxViolation(detail) => {
                    let message = format!("operation blocked by sandbox: {detail}");
                    record.exception = Some(message.clone());
                    self.transition(&mut state, ExecutorState::Exception, turns);
                    violations += 1;
                    if violations > max {
                        self.transition(&mut state, ExecutorState::TerminalFailure, turns);
                        return Ok(ExecutionReport {
                            outcome: ScriptOutcome::SandboxViolation { detail },
                            record: Some(record),
                            model_turns: turns,
                        });
                    }
                    let feedback = format!("{}{}", self.config.exception_prefix, message);
                    session.append(Message::system(feedback))?;
                    continue;
                }
            };

            if retries >= max {
                self.transition(&mut state, ExecutorState::TerminalFailure, turns);
                warn!(
                    session_id = %session.id(),
                    attempts = turns,
                    "script retry budget exhausted"
                );
                return Ok(ExecutionReport {
                    outcome: terminal,
                    record: Some(record),
                    model_turns: turns,
                });
            }
            retries += 1;
            session.append(Message::system(feedback))?;
            self.transition(&mut state, ExecutorState::AwaitModelOutput, turns);
        }
    }

    fn transition(&self, state: &mut ExecutorState, next: ExecutorState, turn: usize) {
        debug!(from = ?*state, to = ?next, turn, "executor transition");
        if matches!(
            next,
            ExecutorState::TerminalSuccess
                | ExecutorState::TerminalNoScript
                | ExecutorState::TerminalFailure
        ) {
            info!(state = ?next, model_turns = turn, "script loop finished");
        }
        *state = next;
    }
}

/// Run a blocking model turn without stalling a multi-threaded runtime.
fn generate_blocking(session: &mut Session) -> Result<scout_engine::GenerationResult> {
    let multi_thread = tokio::runtime::Handle::try_current()
        .map(|h| h.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread)
        .unwrap_or(false);
    if multi_thread {
        tokio::task::block_in_place(|| session.generate_turn(None))
    } else {
        session.generate_turn(None)
    }
}
