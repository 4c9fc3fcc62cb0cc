//! Address resolution behind a capability trait. Resolution algorithms are
//! not this crate's business; the default implementation delegates to the
//! system resolver via tokio.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::lookup_host;

#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Resolves a host and port to a socket address. Unknown hosts fail
    /// with an error.
    async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr>;
}

/// Resolver backed by the operating system (getaddrinfo via tokio).
pub struct SystemResolver;

#[async_trait]
impl AddressResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let mut addresses = lookup_host((host, port))
            .await
            .with_context(|| format!("failed to resolve {}:{}", host, port))?;
        addresses
            .next()
            .with_context(|| format!("no addresses for {}:{}", host, port))
    }
}
