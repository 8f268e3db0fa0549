use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use scout_runtime::ModelRuntime;
use scout_server::{run_server, AppState, ServerConfig};
use tracing_subscriber::EnvFilter;

/// scout HTTP server
#[derive(Parser)]
#[command(name = "scout-server", version)]
struct Args {
    /// TOML config file. Flags override its values.
    #[arg(short, long, env = "SCOUT_CONFIG")]
    config: Option<PathBuf>,

    /// GGUF model to serve.
    #[arg(short, long, env = "SCOUT_MODEL")]
    model: Option<PathBuf>,

    /// Address to listen on.
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Context window in tokens (0 = the model's trained length).
    #[arg(long)]
    context: Option<usize>,

    /// Chat template preset (chatml, llama3, granite, plain).
    #[arg(long)]
    template: Option<String>,

    /// Turns generating at once.
    #[arg(long)]
    max_concurrent: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_toml_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(model) = args.model {
        config.model_path = Some(model);
    }
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(context) = args.context {
        config.load.context_capacity = context;
    }
    if let Some(template) = args.template {
        config.template.preset = Some(template);
    }
    if let Some(n) = args.max_concurrent {
        config.max_concurrent_turns = n;
    }

    let Some(path) = config.model_path.clone() else {
        bail!("no model given: pass --model or set model_path in the config file");
    };
    let model = ModelRuntime::new()
        .load(&path, &config.load)
        .with_context(|| format!("loading {}", path.display()))?;

    let addr = config.bind;
    let state = AppState::new(model, config)?;
    run_server(state, addr).await?;
    Ok(())
}
