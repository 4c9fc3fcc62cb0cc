//! Connection lifecycle states and the ordered connection-establishment
//! flow run by a server connection before its first use.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _, Result};
use bytes::Bytes;
use http::{Method, Version};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::codec::{encode_request_head, MessageReader, RequestHead};
use crate::tls::{ClientTlsContext, Transport};

/// Protocol state of one connection. Exactly one current value per
/// connection, mutated only by that connection's own task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    AwaitingProxyAuthentication,
    AwaitingInitial,
    AwaitingChunk,
    NegotiatingConnect,
    Tunneling,
    DisconnectRequested,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::AwaitingProxyAuthentication => "AWAITING_PROXY_AUTHENTICATION",
            ConnectionState::AwaitingInitial => "AWAITING_INITIAL",
            ConnectionState::AwaitingChunk => "AWAITING_CHUNK",
            ConnectionState::NegotiatingConnect => "NEGOTIATING_CONNECT",
            ConnectionState::Tunneling => "TUNNELING",
            ConnectionState::DisconnectRequested => "DISCONNECT_REQUESTED",
            ConnectionState::Disconnected => "DISCONNECTED",
        };
        f.write_str(name)
    }
}

/// A failed flow carries the state of the last attempted step so the owner
/// can report where establishment broke down.
#[derive(Debug)]
pub struct FlowFailure {
    pub last_state: ConnectionState,
    pub error: anyhow::Error,
}

/// One named step of a connection flow. A step either succeeds and
/// advances the flow, or fails and aborts the remaining steps.
pub enum ConnectionFlowStep {
    TcpConnect {
        addr: SocketAddr,
        connect_timeout: Duration,
    },
    /// Negotiates a CONNECT through an already-connected chained proxy:
    /// writes the CONNECT request for the ultimate origin and requires a
    /// 2xx response head before the tunnel may carry bytes.
    NegotiateConnectThroughChain { origin: String },
    StartTls {
        context: Arc<ClientTlsContext>,
        server_name: String,
    },
}

impl ConnectionFlowStep {
    fn state(&self) -> ConnectionState {
        match self {
            ConnectionFlowStep::TcpConnect { .. } => ConnectionState::Connecting,
            ConnectionFlowStep::NegotiateConnectThroughChain { .. } => {
                ConnectionState::NegotiatingConnect
            }
            ConnectionFlowStep::StartTls { .. } => ConnectionState::Connecting,
        }
    }
}

/// Result of a completed flow: the established transport plus any bytes a
/// negotiation step read past its response head.
pub struct EstablishedTransport {
    pub transport: Transport,
    pub leftover: Bytes,
}

/// Ordered, suspend-capable steps executed before a server connection is
/// usable. The owner's normal processing is paused for the duration.
pub struct ConnectionFlow {
    steps: Vec<ConnectionFlowStep>,
}

impl ConnectionFlow {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn then(mut self, step: ConnectionFlowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub async fn run(self) -> Result<EstablishedTransport, FlowFailure> {
        let mut transport: Option<Transport> = None;
        let mut leftover = Bytes::new();
        for step in self.steps {
            let state = step.state();
            match run_step(step, transport.take(), &mut leftover).await {
                Ok(t) => transport = Some(t),
                Err(error) => {
                    return Err(FlowFailure {
                        last_state: state,
                        error,
                    })
                }
            }
        }
        match transport {
            Some(transport) => Ok(EstablishedTransport { transport, leftover }),
            None => Err(FlowFailure {
                last_state: ConnectionState::Connecting,
                error: anyhow!("connection flow had no connect step"),
            }),
        }
    }
}

impl Default for ConnectionFlow {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_step(
    step: ConnectionFlowStep,
    transport: Option<Transport>,
    leftover: &mut Bytes,
) -> Result<Transport> {
    match step {
        ConnectionFlowStep::TcpConnect {
            addr,
            connect_timeout,
        } => {
            debug!("Connecting to {}", addr);
            let stream = timeout(connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| anyhow!("connect to {} timed out", addr))?
                .with_context(|| format!("connect to {} failed", addr))?;
            Ok(Transport::Plain(stream))
        }
        ConnectionFlowStep::NegotiateConnectThroughChain { origin } => {
            let mut transport = transport.context("CONNECT negotiation before connect")?;
            debug!("Negotiating CONNECT for {} through chained proxy", origin);
            let mut head = RequestHead::new(Method::CONNECT, origin.clone(), Version::HTTP_11);
            head.headers.insert(
                http::header::HOST,
                http::HeaderValue::from_str(&origin).context("invalid CONNECT origin")?,
            );
            transport.write_all(&encode_request_head(&head)).await?;
            transport.flush().await?;

            let mut reader = MessageReader::new(&mut transport);
            let response = reader
                .read_response_head()
                .await?
                .context("chained proxy closed during CONNECT negotiation")?;
            let extra = reader.into_leftover();
            if !response.status.is_success() {
                bail!(
                    "chained proxy refused CONNECT for {}: {}",
                    origin,
                    response.status
                );
            }
            *leftover = extra;
            Ok(transport)
        }
        ConnectionFlowStep::StartTls {
            context,
            server_name,
        } => {
            let transport = transport.context("TLS start before connect")?;
            let stream = match transport {
                Transport::Plain(stream) => stream,
                _ => bail!("TLS start over an already-encrypted transport"),
            };
            let stream = context.connect(&server_name, stream).await?;
            Ok(Transport::ClientTls(Box::new(stream)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_connect_step_produces_a_transport() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let flow = ConnectionFlow::new().then(ConnectionFlowStep::TcpConnect {
            addr,
            connect_timeout: Duration::from_secs(5),
        });
        let established = flow.run().await.unwrap();
        assert!(established.leftover.is_empty());
        drop(established);
        let (_socket, _) = listener.accept().await.unwrap();
    }

    #[tokio::test]
    async fn failed_connect_reports_connecting_state() {
        // Port 1 on localhost is essentially never listening.
        let flow = ConnectionFlow::new().then(ConnectionFlowStep::TcpConnect {
            addr: "127.0.0.1:1".parse().unwrap(),
            connect_timeout: Duration::from_secs(5),
        });
        let failure = flow.run().await.err().unwrap();
        assert_eq!(failure.last_state, ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn chain_negotiation_requires_2xx() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            tokio::io::AsyncWriteExt::write_all(
                &mut socket,
                b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n",
            )
            .await
            .unwrap();
        });
        let flow = ConnectionFlow::new()
            .then(ConnectionFlowStep::TcpConnect {
                addr,
                connect_timeout: Duration::from_secs(5),
            })
            .then(ConnectionFlowStep::NegotiateConnectThroughChain {
                origin: "example.com:443".to_string(),
            });
        let failure = flow.run().await.err().unwrap();
        assert_eq!(failure.last_state, ConnectionState::NegotiatingConnect);
    }

    #[tokio::test]
    async fn chain_negotiation_succeeds_and_keeps_leftover() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            tokio::io::AsyncWriteExt::write_all(
                &mut socket,
                b"HTTP/1.1 200 Connection established\r\n\r\nearly-bytes",
            )
            .await
            .unwrap();
        });
        let flow = ConnectionFlow::new()
            .then(ConnectionFlowStep::TcpConnect {
                addr,
                connect_timeout: Duration::from_secs(5),
            })
            .then(ConnectionFlowStep::NegotiateConnectThroughChain {
                origin: "example.com:443".to_string(),
            });
        let established = flow.run().await.unwrap();
        // Bytes the chain sent right behind its 200 must not be lost.
        assert_eq!(&established.leftover[..], b"early-bytes");
    }
}
