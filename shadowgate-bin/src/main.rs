use anyhow::Result;
use clap::Parser;
use shadowgate_core::{Config, ShadowGate};
use std::fs;

/// Shadowgate - a Shadowsocks 2022 TCP proxy server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Test configuration and exit
    #[arg(short, long)]
    test_config: bool,
}

#[cfg(unix)]
async fn wait_for_signal(shutdown_tx: tokio::sync::mpsc::Sender<()>) {
    use futures::StreamExt;
    if let Ok(mut signals) = signal_hook_tokio::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ]) {
        if signals.next().await.is_some() {
            let _ = shutdown_tx.send(()).await;
        }
    }
}

#[cfg(windows)]
async fn wait_for_signal(shutdown_tx: tokio::sync::mpsc::Sender<()>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        let _ = shutdown_tx.send(()).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_content = fs::read_to_string(&args.config)?;
    let config: Config = serde_yaml::from_str(&config_content)?;

    if args.test_config {
        config.validate()?;
        println!("Configuration test passed!");
        return Ok(());
    }

    let gate = ShadowGate::new(config)?;

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel(1);
    tokio::spawn(wait_for_signal(shutdown_tx));

    gate.start().await?;
    tracing::info!("shadowgate running, send SIGINT/SIGTERM to stop");

    shutdown_rx.recv().await;

    tracing::info!("shutting down");
    gate.stop().await?;
    Ok(())
}
