use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use scout_agents::ScriptExecutor;
use scout_cli::{
    demo_model, generate, inspect, load_model, new_session, open_history, CliConfig, Repl,
};
use scout_engine::QuantizationTag;
use tracing_subscriber::EnvFilter;

/// scout: a local language-model runtime
#[derive(Parser)]
#[command(name = "scout", version)]
struct Cli {
    /// TOML config file. Flags override its values.
    #[arg(short, long, global = true, env = "SCOUT_CONFIG")]
    config: Option<PathBuf>,

    /// GGUF model artifact.
    #[arg(short, long, global = true, env = "SCOUT_MODEL")]
    model: Option<PathBuf>,

    /// Context window in tokens (0 = the model's trained length).
    #[arg(long, global = true)]
    context: Option<usize>,

    /// Chat template preset (chatml, llama3, granite, plain).
    #[arg(long, global = true)]
    template: Option<String>,

    /// System prompt.
    #[arg(long, global = true)]
    system: Option<String>,

    /// Sampling temperature (0 = greedy).
    #[arg(short, long, global = true)]
    temperature: Option<f32>,

    /// Maximum tokens per reply.
    #[arg(long, global = true)]
    max_tokens: Option<usize>,

    /// Random seed for reproducible sampling.
    #[arg(short, long, global = true)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Interactive chat with streamed replies.
    Chat {
        /// JSON transcript to resume from and save to after every turn.
        #[arg(long)]
        history: Option<PathBuf>,
    },
    /// Generate one reply to a prompt.
    Generate {
        /// Input prompt text.
        prompt: String,
    },
    /// Solve a task by letting the model write and run Python.
    Code {
        /// What to do.
        task: String,

        /// Corrective retries after the first attempt.
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Print a GGUF artifact's header.
    Inspect {
        path: PathBuf,
    },
    /// Write the tiny seeded demo model.
    DemoModel {
        path: PathBuf,

        /// Weight storage: F32, F16, Q8_0, Q4_0 or Q4_1.
        #[arg(short, long, default_value = "F32")]
        quantization: QuantizationTag,
    },
}

impl Cli {
    fn config(&self) -> anyhow::Result<CliConfig> {
        let mut config = CliConfig::load(self.config.as_deref())?;
        if let Some(n) = self.context {
            config.load.context_capacity = n;
        }
        if let Some(preset) = &self.template {
            config.template.preset = Some(preset.clone());
        }
        if let Some(system) = &self.system {
            config.system = Some(system.clone());
        }
        if let Some(t) = self.temperature {
            config.sampler.temperature = t;
        }
        if let Some(n) = self.max_tokens {
            config.sampler.max_new_tokens = n;
        }
        if let Some(seed) = self.seed {
            config.sampler.seed = Some(seed);
        }
        config
            .sampler
            .validate()
            .context("invalid sampling options")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = cli.config()?;
    match cli.command {
        Command::Chat { history } => {
            let model = load_model(cli.model.as_deref(), &config)?;
            let session = match &history {
                Some(path) => open_history(model, &config, path)?,
                None => new_session(model, &config)?,
            };
            let mut repl = Repl::new(session).with_policy(config.partial);
            if let Some(path) = history {
                repl = repl.with_history(path);
            }

            let interrupt = repl.interrupt_handle();
            tokio::spawn(async move {
                while tokio::signal::ctrl_c().await.is_ok() {
                    interrupt.interrupt();
                }
            });

            eprintln!("type /help for commands, /exit or Ctrl-D to quit");
            tokio::task::spawn_blocking(move || {
                let stdin = io::stdin();
                let mut stdout = io::stdout();
                repl.run(stdin.lock(), &mut stdout)
            })
            .await??;
            Ok(ExitCode::SUCCESS)
        }
        Command::Generate { prompt } => {
            let model = load_model(cli.model.as_deref(), &config)?;
            let mut stdout = io::stdout();
            tokio::task::block_in_place(|| generate(model, &config, &prompt, &mut stdout))?;
            writeln!(stdout)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Code { task, max_attempts } => {
            if let Some(n) = max_attempts {
                config.executor.max_attempts = n;
            }
            let model = load_model(cli.model.as_deref(), &config)?;
            let mut session = new_session(model, &config)?;
            let executor = ScriptExecutor::new(config.executor.clone());
            executor.prepare(&mut session)?;

            let report = executor.run(&mut session, &task).await?;
            println!("{report}");
            Ok(if report.outcome.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Inspect { path } => {
            inspect(&path, &mut io::stdout().lock())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::DemoModel { path, quantization } => {
            let seed = config.sampler.seed.unwrap_or(42);
            demo_model(&path, quantization, seed)?;
            println!("wrote {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}
