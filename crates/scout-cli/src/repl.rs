//! The interactive chat loop.
//!
//! One line in, one streamed reply out. Lines starting with `/` are
//! commands. Ctrl-C (via [`InterruptHandle`]) cancels the turn in progress
//! without leaving the loop.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use scout_agents::{PartialPolicy, Session};
use scout_engine::FinishReason;
use scout_runtime::CancellationToken;
use tracing::debug;

use crate::{save_history, stream_turn, CliError};

const HELP: &str = "\
commands:
  /reset            clear the conversation (keeps the system prompt)
  /system [text]    set the system prompt, or clear it with no text
  /save [path]      write the transcript as JSON
  /help             show this help
  /exit             quit
Ctrl-C cancels the reply in progress.";

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Say(String),
    Reset,
    System(Option<String>),
    Save(Option<PathBuf>),
    Help,
    Exit,
    Empty,
    Unknown(String),
}

impl ReplCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return ReplCommand::Empty;
        }
        if !line.starts_with('/') {
            return ReplCommand::Say(line.to_string());
        }
        let (name, arg) = match line.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, Some(arg.trim()).filter(|a| !a.is_empty())),
            None => (line, None),
        };
        match name {
            "/reset" => ReplCommand::Reset,
            "/system" => ReplCommand::System(arg.map(str::to_string)),
            "/save" => ReplCommand::Save(arg.map(PathBuf::from)),
            "/help" => ReplCommand::Help,
            "/exit" | "/quit" => ReplCommand::Exit,
            other => ReplCommand::Unknown(other.to_string()),
        }
    }
}

/// Cancels whichever turn is currently running.
#[derive(Clone)]
pub struct InterruptHandle(Arc<Mutex<CancellationToken>>);

impl InterruptHandle {
    pub fn interrupt(&self) {
        if let Ok(token) = self.0.lock() {
            token.cancel();
        }
    }
}

pub struct Repl {
    session: Session,
    policy: PartialPolicy,
    history: Option<PathBuf>,
    current: Arc<Mutex<CancellationToken>>,
}

impl Repl {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            policy: PartialPolicy::Discard,
            history: None,
            current: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    pub fn with_policy(mut self, policy: PartialPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Save the transcript to `path` after every turn.
    pub fn with_history(mut self, path: PathBuf) -> Self {
        self.history = Some(path);
        self
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle(self.current.clone())
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    fn fresh_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut slot) = self.current.lock() {
            *slot = token.clone();
        }
        token
    }

    /// Read commands until `/exit` or end of input.
    pub fn run<R: BufRead, W: Write>(&mut self, mut input: R, out: &mut W) -> Result<(), CliError> {
        let io_err = |source| CliError::Io {
            path: "<terminal>".into(),
            source,
        };
        let mut line = String::new();
        loop {
            write!(out, "> ").and_then(|_| out.flush()).map_err(io_err)?;
            line.clear();
            if input.read_line(&mut line).map_err(io_err)? == 0 {
                break;
            }
            if !self.handle(ReplCommand::parse(&line), out)? {
                break;
            }
        }
        Ok(())
    }

    /// Execute one command. Returns `false` when the loop should end.
    ///
    /// Session errors (a message that cannot fit, an invalid system prompt)
    /// are printed and the loop continues; only output failures are returned.
    pub fn handle<W: Write>(&mut self, command: ReplCommand, out: &mut W) -> Result<bool, CliError> {
        let io_err = |source| CliError::Io {
            path: "<terminal>".into(),
            source,
        };
        match command {
            ReplCommand::Empty => {}
            ReplCommand::Exit => return Ok(false),
            ReplCommand::Help => writeln!(out, "{HELP}").map_err(io_err)?,
            ReplCommand::Unknown(name) => {
                writeln!(out, "unknown command {name}; try /help").map_err(io_err)?
            }
            ReplCommand::Reset => {
                self.session.reset();
                writeln!(out, "(conversation cleared)").map_err(io_err)?;
            }
            ReplCommand::System(prompt) => {
                let cleared = prompt.is_none();
                match self.session.set_system_prompt(prompt) {
                    Ok(()) if cleared => writeln!(out, "(system prompt cleared)").map_err(io_err)?,
                    Ok(()) => writeln!(out, "(system prompt set)").map_err(io_err)?,
                    Err(e) => writeln!(out, "error: {e}").map_err(io_err)?,
                }
            }
            ReplCommand::Save(path) => match path.or_else(|| self.history.clone()) {
                Some(path) => {
                    save_history(&self.session, &path)?;
                    writeln!(out, "(saved to {})", path.display()).map_err(io_err)?;
                }
                None => writeln!(out, "usage: /save <path>").map_err(io_err)?,
            },
            ReplCommand::Say(text) => self.say(&text, out)?,
        }
        Ok(true)
    }

    fn say<W: Write>(&mut self, text: &str, out: &mut W) -> Result<(), CliError> {
        let io_err = |source| CliError::Io {
            path: "<terminal>".into(),
            source,
        };
        let cancel = self.fresh_token();
        match stream_turn(&mut self.session, text, cancel, self.policy, out) {
            Ok(result) => {
                debug!(
                    finish_reason = %result.finish_reason,
                    tokens = result.generated_tokens,
                    "turn finished"
                );
                if result.finish_reason == FinishReason::Cancelled {
                    writeln!(out, "\n[cancelled]").map_err(io_err)?;
                } else {
                    writeln!(out).map_err(io_err)?;
                }
            }
            Err(CliError::Session(e)) => writeln!(out, "error: {e}").map_err(io_err)?,
            Err(e) => return Err(e),
        }
        if let Some(path) = &self.history {
            save_history(&self.session, path)?;
        }
        Ok(())
    }
}
