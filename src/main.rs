use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;

use fwdproxy::hooks::{StaticAuthenticator, StaticChainProxyManager};
use fwdproxy::proxy::{ProxyConfig, ProxyServer, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDLE_TIMEOUT};

#[derive(Parser, Debug)]
#[command(name = "fwdproxy")]
#[command(version, about, long_about = None)]
#[command(about = "HTTP/1.x forward proxy with CONNECT tunneling and proxy chaining")]
struct Args {
    /// Address to listen on
    #[arg(short = 'l', long = "listen", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Require proxy authentication with these credentials (USER:PASS)
    #[arg(long = "auth", value_name = "USER:PASS")]
    auth: Option<String>,

    /// Forward all requests through an upstream proxy (HOST:PORT)
    #[arg(long = "chain", value_name = "HOST:PORT")]
    chain: Option<String>,

    /// Relay messages without rewriting headers
    #[arg(long = "transparent")]
    transparent: bool,

    /// Host name to use in appended Via headers
    #[arg(long = "via", value_name = "HOST", default_value = "localhost")]
    via: String,

    /// Timeout for connecting to servers, in seconds
    #[arg(long = "connect-timeout", value_name = "SECS", default_value_t = DEFAULT_CONNECT_TIMEOUT.as_secs())]
    connect_timeout: u64,

    /// Disconnect idle client connections after this many seconds
    #[arg(long = "idle-timeout", value_name = "SECS", default_value_t = DEFAULT_IDLE_TIMEOUT.as_secs())]
    idle_timeout: u64,

    /// Increase verbosity (-vvv for max)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(format!("fwdproxy={}", level))
        .init();
}

fn build_config(args: &Args) -> Result<ProxyConfig> {
    let mut config = ProxyConfig {
        transparent: args.transparent,
        connect_timeout: Duration::from_secs(args.connect_timeout),
        idle_timeout: Duration::from_secs(args.idle_timeout),
        via_host: args.via.clone(),
        ..ProxyConfig::default()
    };

    if let Some(auth) = &args.auth {
        let Some((username, password)) = auth.split_once(':') else {
            bail!("--auth expects USER:PASS");
        };
        config.authenticator = Some(Arc::new(StaticAuthenticator::new(username, password)));
    }

    if let Some(chain) = &args.chain {
        if !chain.contains(':') {
            bail!("--chain expects HOST:PORT");
        }
        config.chain_proxy_manager = Some(Arc::new(StaticChainProxyManager::new(chain.clone())));
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(args.verbose);

    let config = build_config(&args)?;
    let server = ProxyServer::new(args.listen, config);
    let addr = server.start().await?;
    info!("fwdproxy listening on {}", addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}
