//! Proxy server bootstrap: configuration, the listening socket, and the
//! accept loop that spawns one client-connection task per inbound socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::client;
use crate::hooks::{
    ActivityTracker, ChainProxyManager, ProxyAuthenticator, RequestFilter, ResponseFilters,
};
use crate::resolver::{AddressResolver, SystemResolver};
use crate::tls::ServerTlsContext;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(40);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(70);

/// Everything the connection state machines need to know about how this
/// proxy instance is configured. Collaborator capabilities are optional;
/// absent ones disable the corresponding behavior.
pub struct ProxyConfig {
    /// Transparent proxies skip all header rewriting that would reveal
    /// their presence.
    pub transparent: bool,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    /// Host name used in appended Via tokens.
    pub via_host: String,
    pub authenticator: Option<Arc<dyn ProxyAuthenticator>>,
    pub request_filter: Option<Arc<dyn RequestFilter>>,
    pub response_filters: Option<Arc<dyn ResponseFilters>>,
    pub chain_proxy_manager: Option<Arc<dyn ChainProxyManager>>,
    pub activity_trackers: Vec<Arc<dyn ActivityTracker>>,
    pub resolver: Arc<dyn AddressResolver>,
    /// When set, client connections are TLS-terminated with this context.
    pub server_tls: Option<Arc<ServerTlsContext>>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            transparent: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            via_host: "localhost".to_string(),
            authenticator: None,
            request_filter: None,
            response_filters: None,
            chain_proxy_manager: None,
            activity_trackers: Vec::new(),
            resolver: Arc::new(SystemResolver),
            server_tls: None,
        }
    }
}

/// Process-wide counters, observability only: no control decision is ever
/// based on these.
#[derive(Default)]
pub struct ProxyStats {
    clients_accepted: AtomicU64,
    server_connections_opened: AtomicU64,
    server_connections_reused: AtomicU64,
}

impl ProxyStats {
    pub(crate) fn record_client_accepted(&self) {
        self.clients_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_server_connection(&self) {
        self.server_connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_server_connection_reused(&self) {
        self.server_connections_reused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clients_accepted(&self) -> u64 {
        self.clients_accepted.load(Ordering::Relaxed)
    }

    pub fn server_connections_opened(&self) -> u64 {
        self.server_connections_opened.load(Ordering::Relaxed)
    }

    pub fn server_connections_reused(&self) -> u64 {
        self.server_connections_reused.load(Ordering::Relaxed)
    }
}

pub struct ProxyServer {
    listen: SocketAddr,
    config: Arc<ProxyConfig>,
    stats: Arc<ProxyStats>,
}

impl ProxyServer {
    pub fn new(listen: SocketAddr, config: ProxyConfig) -> Self {
        Self {
            listen,
            config: Arc::new(config),
            stats: Arc::new(ProxyStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ProxyStats> {
        Arc::clone(&self.stats)
    }

    /// Binds the listener and spawns the accept loop. Returns the bound
    /// address (useful with port 0).
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(self.listen).await?;
        let addr = listener.local_addr()?;
        info!("Proxy listening on {}", addr);

        let config = Arc::clone(&self.config);
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("New client connection from {}", peer);
                        stats.record_client_accepted();
                        let config = Arc::clone(&config);
                        let stats = Arc::clone(&stats);
                        tokio::spawn(async move {
                            if let Err(e) = client::run(stream, peer, config, stats).await {
                                // Peers hanging up mid-message is routine.
                                if is_disconnect(&e) {
                                    debug!("Client connection {} closed: {:#}", peer, e);
                                } else {
                                    warn!("Client connection {} ended with error: {:#}", peer, e);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept client connection: {}", e);
                    }
                }
            }
        });

        Ok(addr)
    }
}

fn is_disconnect(error: &anyhow::Error) -> bool {
    error
        .root_cause()
        .downcast_ref::<std::io::Error>()
        .map(|io| {
            matches!(
                io.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::UnexpectedEof
            )
        })
        .unwrap_or(false)
}
