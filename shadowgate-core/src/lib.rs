pub mod cipher;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod relay;
pub mod replay;
pub mod server;
pub mod session;

#[cfg(test)]
mod tests;

pub use config::{Config, GeneralConfig, LogLevel, ServerConfig};
pub use error::{Error, Result};
pub use protocol::TargetAddr;
pub use server::{ServerState, ShadowsocksServer};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Top-level handle over every configured listener.
pub struct ShadowGate {
    config: Config,
    servers: Vec<Arc<ShadowsocksServer>>,
    shutdown: CancellationToken,
    running: Arc<AtomicBool>,
}

impl ShadowGate {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        logging::init_logging(config.general.log_level)?;

        let servers = config
            .servers
            .iter()
            .map(|server_config| ShadowsocksServer::new(server_config.clone()).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            servers,
            shutdown: CancellationToken::new(),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Start every listener. Non-blocking; acceptors run as detached tasks.
    pub async fn start(&self) -> Result<()> {
        for server in &self.servers {
            server.start().await?;
        }
        self.running.store(true, Ordering::Relaxed);
        tracing::info!("shadowgate started with {} server(s)", self.servers.len());
        Ok(())
    }

    /// Start every listener and block until [`ShadowGate::stop`] is called.
    pub async fn start_blocking(&self) -> Result<()> {
        self.start().await?;
        self.shutdown.cancelled().await;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        for server in &self.servers {
            server.stop().await?;
        }
        self.shutdown.cancel();
        self.running.store(false, Ordering::Relaxed);
        tracing::info!("shadowgate stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn servers(&self) -> &[Arc<ShadowsocksServer>] {
        &self.servers
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
