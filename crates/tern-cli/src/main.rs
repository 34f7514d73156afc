//! tern - headless driver for the conversation engine

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tern_agent::{ConversationEngine, EngineConfig, EngineEvent, ProviderTransport};
use tern_ai::AnthropicProvider;
use tokio_stream::{StreamExt, wrappers::UnboundedReceiverStream};
use tracing_subscriber::EnvFilter;

/// tern - run one prompt through the conversation engine
#[derive(Parser, Debug)]
#[command(name = "tern")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Prompt to send
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// Config file (default: $TERN_CONFIG_PATH or <config dir>/tern/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Check the config file and its permission rules, then exit
    #[arg(long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("tern=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();

    let config = match &args.config {
        Some(path) => EngineConfig::load_from(path),
        None => EngineConfig::load(),
    }
    .context("loading configuration")?;
    tracing::debug!(model = %config.model.id, max_turns = config.max_turns, "Loaded configuration");

    if args.validate_config {
        config.permission_context().context("validating permission rules")?;
        println!("Configuration OK ({})", config.model.id);
        return Ok(());
    }

    let Some(prompt) = args.command else {
        anyhow::bail!("nothing to do; pass a prompt with -c");
    };

    let provider = AnthropicProvider::from_env().context("set ANTHROPIC_API_KEY to talk to the model")?;
    let transport = Arc::new(ProviderTransport::new(provider).with_retry_config(config.retry_config()));
    let mut engine = ConversationEngine::new(config, transport)?;

    let events = engine
        .take_events()
        .context("event receiver already taken")?;
    let printer = tokio::spawn(print_events(UnboundedReceiverStream::new(events)));

    let handle = engine.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.abort();
        }
    });

    let result = engine.prompt(prompt).await;
    drop(engine);
    printer.await?;

    match result {
        Ok(()) | Err(tern_agent::Error::Cancelled) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn print_events(mut events: UnboundedReceiverStream<EngineEvent>) {
    let mut stdout = io::stdout();
    while let Some(event) = events.next().await {
        match event {
            EngineEvent::TextDelta { text } => {
                print!("{text}");
                stdout.flush().ok();
            }
            EngineEvent::ToolCallRequested { request } => {
                print!("\n[{}...", request.name);
                stdout.flush().ok();
            }
            EngineEvent::ToolCompleted { is_error, .. } => {
                println!("{}]", if is_error { " error" } else { " done" });
            }
            EngineEvent::TurnCompleted { .. } => println!(),
            EngineEvent::CompactionCompleted { report } => {
                eprintln!(
                    "[compacted {} -> {} messages, saved ~{} tokens]",
                    report.original_count, report.compacted_count, report.token_savings
                );
            }
            EngineEvent::Error { message } => eprintln!("Error: {message}"),
            _ => {}
        }
    }
}
