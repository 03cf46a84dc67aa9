use crate::cipher::CipherSuite;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::relay;
use crate::replay::SaltCache;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// State shared by every session of one listener: the PSK, the suite, and
/// the replay-defense cache. The cache is the only thing mutated across
/// sessions; everything else a session owns exclusively.
pub struct ServerState {
    pub suite: CipherSuite,
    pub psk: Vec<u8>,
    pub salt_cache: SaltCache,
}

/// One Shadowsocks 2022 TCP listener.
pub struct ShadowsocksServer {
    config: ServerConfig,
    state: Arc<ServerState>,
    cancel_token: CancellationToken,
    running: Arc<AtomicBool>,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl ShadowsocksServer {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let suite = CipherSuite::parse(&config.method)?;
        let psk = config.decode_key(suite)?;
        Ok(Self {
            config,
            state: Arc::new(ServerState {
                suite,
                psk,
                salt_cache: SaltCache::new(),
            }),
            cancel_token: CancellationToken::new(),
            running: Arc::new(AtomicBool::new(false)),
            local_addr: RwLock::new(None),
        })
    }

    pub fn tag(&self) -> &str {
        &self.config.tag
    }

    /// Address the listener actually bound, once started. Useful when the
    /// configured port is 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.read().ok().and_then(|slot| *slot)
    }

    /// Bind the listener and spawn the acceptor. Non-blocking; returns once
    /// the socket is listening.
    pub async fn start(&self) -> Result<()> {
        if self.running.load(Ordering::Relaxed) {
            return Ok(());
        }
        let addr: SocketAddr = format!("{}:{}", self.config.listen, self.config.port)
            .parse()
            .map_err(|e| Error::config(format!("Invalid listen address: {}", e)))?;
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .map_err(|e| Error::network(format!("Failed to create socket: {}", e)))?;
        socket.set_reuse_address(true).ok();
        socket.set_nonblocking(true).ok();
        socket
            .bind(&addr.into())
            .map_err(|e| Error::network(format!("Failed to bind {}: {}", addr, e)))?;
        socket
            .listen(1024)
            .map_err(|e| Error::network(format!("Failed to listen: {}", e)))?;
        let listener: TcpListener = TcpListener::from_std(socket.into())
            .map_err(|e| Error::network(format!("Failed to create listener: {}", e)))?;
        let bound = listener
            .local_addr()
            .map_err(|e| Error::network(format!("Failed to read local addr: {}", e)))?;
        if let Ok(mut slot) = self.local_addr.write() {
            *slot = Some(bound);
        }

        let state = Arc::clone(&self.state);
        let cancel_token = self.cancel_token.clone();
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::Relaxed);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                let state = Arc::clone(&state);
                                let cancel = cancel_token.clone();
                                tokio::spawn(async move {
                                    relay::handle_connection(stream, peer_addr, state, cancel).await;
                                });
                            }
                            Err(e) => tracing::error!("accept error: {}", e),
                        }
                    }
                }
            }
            running.store(false, Ordering::Relaxed);
        });
        tracing::info!(
            "shadowsocks server '{}' listening on {}",
            self.config.tag,
            bound
        );
        Ok(())
    }

    /// Cancel the acceptor and every live session, then wait for the
    /// acceptor to drain.
    pub async fn stop(&self) -> Result<()> {
        self.cancel_token.cancel();
        let mut attempts = 0;
        while self.running.load(Ordering::Relaxed) && attempts < 50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            attempts += 1;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}
