use clap::Parser;
use futures::StreamExt;
use std::io::Write;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing_subscriber::{fmt, EnvFilter};

use somnia_core::{ContentStore, Ledger, ModelRegistry, SomniaConfig, StorageError};
use somnia_session::{Collaborators, SessionOutput, Supervisor};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "somnia.toml")]
    config: String,

    /// Probe the inference, storage and ledger services and exit.
    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Logs go to stderr; stdout carries the session.
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    let config = match SomniaConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    let deps = Collaborators::from_config(&config)?;

    if args.health {
        return health_check(&config, deps.models.as_ref(), deps.store.as_ref(), deps.ledger.as_ref()).await;
    }

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = signal_tx.send(());
    });

    let (events_tx, mut events_rx) = mpsc::channel(config.workers.command_buffer.max(1) * 4);
    let mut supervisor = Supervisor::new(config);
    supervisor.initialize(deps, events_tx, &shutdown_tx)?;

    let mut stdin = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
    let mut prompt_shown = false;
    println!("Somnia session started. Type 'help' for a list of commands.");

    loop {
        if !prompt_shown {
            if let Some(prompt) = supervisor.prompt() {
                print!("{}", prompt);
                std::io::stdout().flush()?;
                prompt_shown = true;
            }
        }

        let outputs = tokio::select! {
            line = stdin.next() => match line {
                Some(Ok(line)) => supervisor.submit_line(&line).await,
                Some(Err(e)) => {
                    tracing::error!("Input error: {}", e);
                    break;
                }
                None => break,
            },
            Some(event) = events_rx.recv() => supervisor.handle_event(event).await,
            _ = shutdown_rx.recv() => break,
        };

        if !outputs.is_empty() {
            if prompt_shown {
                println!();
            }
            render(&outputs);
            prompt_shown = false;
        }
        if supervisor.is_finished() {
            break;
        }
    }

    supervisor.shutdown().await;
    Ok(())
}

fn render(outputs: &[SessionOutput]) {
    for output in outputs {
        match output {
            SessionOutput::Line(text) => println!("{}", text),
            SessionOutput::Error(text) => println!("error: {}", text),
            SessionOutput::Clear => print!("\x1B[2J\x1B[H"),
        }
    }
}

async fn health_check(
    config: &SomniaConfig,
    models: &dyn ModelRegistry,
    store: &dyn ContentStore,
    ledger: &dyn Ledger,
) -> anyhow::Result<()> {
    let mut healthy = true;

    match models.list_models().await {
        Ok(list) => println!("✅ Inference reachable: {} models", list.len()),
        Err(e) => {
            println!("❌ Inference check failed: {}", e);
            healthy = false;
        }
    }

    // Any answer other than a transport or server error means the store is up.
    match store.get("health-probe").await {
        Ok(_) | Err(StorageError::NotFound { .. }) => println!("✅ Storage reachable: {}", store.name()),
        Err(e) => {
            println!("❌ Storage check failed: {}", e);
            healthy = false;
        }
    }

    match ledger.read_memory(config.identity.agent_id).await {
        Ok(memory) => println!(
            "✅ Ledger reachable: identity #{} has {} dreams",
            memory.identity_id, memory.dream_count
        ),
        Err(e) => {
            println!("❌ Ledger check failed: {}", e);
            healthy = false;
        }
    }

    if !healthy {
        std::process::exit(1);
    }
    println!("✅ Somnia health check passed");
    Ok(())
}
