//! agentgov service binary

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use agentgov::config::Settings;
use agentgov::ops::{Services, rpc};

#[derive(Parser)]
#[command(name = "agentgov", version, about = "AI-agent governance runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the governance service on stdio
    Serve,
    /// Verify configuration and store connectivity, then exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;

    match cli.command {
        Command::Check => {
            let services = Services::init(settings).await?;
            services.store.ping().await?;
            println!("configuration ok, store reachable");
            Ok(())
        }
        Command::Serve => serve(settings).await,
    }
}

async fn serve(settings: Settings) -> Result<()> {
    let services = Services::init(settings).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let detector = tokio::spawn(
        Arc::clone(&services.detector).run(shutdown_rx.clone()),
    );

    let mut surface = tokio::spawn(rpc::serve_stdio(Arc::clone(&services), shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            let _ = (&mut surface).await;
        }
        result = &mut surface => {
            // stdin closed; stop the background loops too.
            let _ = shutdown_tx.send(true);
            match result {
                Ok(result) => result?,
                Err(err) => tracing::error!(error = %err, "rpc surface task failed"),
            }
        }
    }

    let _ = detector.await;
    Ok(())
}
