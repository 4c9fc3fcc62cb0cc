//! Server side of the proxy: one `ProxyToServerConnection` per
//! (client, host:port) pair. Each runs as its own task, establishes its
//! transport through a `ConnectionFlow`, forwards whatever the client
//! connection hands it, and pushes decoded responses back through the
//! owning client connection's event channel.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use bytes::Bytes;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tracing::{debug, warn};

use crate::codec::{
    encode_body_chunk, encode_request_head, is_chunked, response_body_kind, BodyKind, BodyState,
    Chunk, MessageReader, RequestHead, ResponseHead,
};
use crate::flow::{ConnectionFlow, ConnectionFlowStep, ConnectionState, EstablishedTransport};
use crate::hooks::{FlowContext, TransportProtocol};
use crate::proxy::{ProxyConfig, ProxyStats};
use crate::tls::{ClientTlsContext, Transport};

const COMMAND_CHANNEL_CAPACITY: usize = 32;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Work handed from the client connection to a server connection.
pub(crate) enum ServerCommand {
    /// A rewritten request to forward, with the unmodified snapshot kept
    /// for tracking and close decisions.
    Request {
        head: RequestHead,
        original: RequestHead,
    },
    BodyChunk(Chunk),
    Raw(Bytes),
    /// Chain→direct fallback: reattempt the connection flow against a new
    /// address, preserving this connection's identity and registry entry.
    /// `head` is absent for CONNECT retries, which write no request.
    RetryConnect {
        addr: SocketAddr,
        head: Option<RequestHead>,
        original: RequestHead,
    },
    Disconnect,
}

pub(crate) enum ResponsePayload {
    Head(ResponseHead),
    Chunk(Chunk),
}

/// Notifications a server connection delivers to its owning client
/// connection. `Respond` is the only path by which response data reaches
/// the client.
pub(crate) enum ServerEvent {
    ConnectSucceeded {
        host_and_port: String,
        connection_id: u64,
    },
    ConnectFailed {
        host_and_port: String,
        connection_id: u64,
        last_state: ConnectionState,
        request: RequestHead,
        was_chained: bool,
    },
    Respond {
        host_and_port: String,
        server_host_and_port: String,
        request: RequestHead,
        response: ResponseHead,
        payload: ResponsePayload,
    },
    TunnelData {
        data: Bytes,
    },
    Disconnected {
        host_and_port: String,
        connection_id: u64,
        had_connected: bool,
    },
}

/// Client-side handle to a spawned server connection. Dropping the handle
/// closes the command channel, which the connection treats as its
/// disconnect signal; disconnection is therefore idempotent.
pub(crate) struct ServerHandle {
    pub host_and_port: String,
    /// Origin this connection actually serves. Matches `host_and_port`
    /// except when the registry key is a chained proxy's address.
    pub server_host_and_port: String,
    pub connection_id: u64,
    /// Whether requests on this connection still go through a chained
    /// proxy. Cleared after a chain→direct fallback, so reused requests
    /// are rewritten for a direct hop.
    pub chained: bool,
    commands: mpsc::Sender<ServerCommand>,
    saturated: Arc<AtomicBool>,
    tunnel: bool,
}

impl ServerHandle {
    /// CONNECT connections carry opaque tunnel bytes for their remaining
    /// lifetime and are never reusable.
    pub fn reusable(&self) -> bool {
        !self.tunnel
    }

    pub fn is_saturated(&self) -> bool {
        self.saturated.load(Ordering::Relaxed)
    }

    /// Reserves a command-channel slot, tracking saturation while the
    /// bounded channel is full. A full channel parks the caller, which is
    /// what stops the client connection from reading ahead of a slow
    /// origin. Cancelling the returned future releases nothing.
    pub async fn reserve(&self) -> Result<mpsc::Permit<'_, ServerCommand>, SendError<()>> {
        match self.commands.try_reserve() {
            Ok(permit) => {
                self.saturated.store(false, Ordering::Relaxed);
                Ok(permit)
            }
            Err(TrySendError::Full(())) => {
                self.saturated.store(true, Ordering::Relaxed);
                let result = self.commands.reserve().await;
                self.saturated.store(false, Ordering::Relaxed);
                result
            }
            Err(TrySendError::Closed(())) => Err(SendError(())),
        }
    }

    /// Sends a command, tracking saturation while the bounded channel is
    /// full.
    pub async fn send(&self, command: ServerCommand) -> Result<(), SendError<ServerCommand>> {
        match self.commands.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(command)) => {
                self.saturated.store(true, Ordering::Relaxed);
                let result = self.commands.send(command).await;
                self.saturated.store(false, Ordering::Relaxed);
                result
            }
            Err(TrySendError::Closed(command)) => Err(SendError(command)),
        }
    }
}

/// Construction parameters for a server connection.
pub(crate) struct ServerConnectionSpec {
    /// Registry key: the chained proxy's host:port when chaining,
    /// otherwise the origin's.
    pub host_and_port: String,
    /// The ultimate origin, as resolved from the request.
    pub server_host_and_port: String,
    pub chained_host_and_port: Option<String>,
    pub addr: SocketAddr,
    pub tls: Option<Arc<ClientTlsContext>>,
    /// Unmodified snapshot of the request that prompted this connection.
    pub initial_request: RequestHead,
    pub is_connect: bool,
    pub client_address: SocketAddr,
}

pub(crate) fn spawn(
    spec: ServerConnectionSpec,
    config: Arc<ProxyConfig>,
    stats: Arc<ProxyStats>,
    events: mpsc::Sender<ServerEvent>,
) -> ServerHandle {
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let saturated = Arc::new(AtomicBool::new(false));
    let handle = ServerHandle {
        host_and_port: spec.host_and_port.clone(),
        server_host_and_port: spec.server_host_and_port.clone(),
        connection_id,
        chained: spec.chained_host_and_port.is_some(),
        commands: commands_tx,
        saturated: Arc::clone(&saturated),
        tunnel: spec.is_connect,
    };
    let connection = ProxyToServerConnection {
        host_and_port: spec.host_and_port,
        server_host_and_port: spec.server_host_and_port,
        chained_host_and_port: spec.chained_host_and_port,
        addr: spec.addr,
        tls: spec.tls,
        initial_request: spec.initial_request,
        is_connect: spec.is_connect,
        client_address: spec.client_address,
        connection_id,
        state: ConnectionState::Connecting,
        config,
        stats,
        events,
        saturated,
    };
    tokio::spawn(connection.run(commands_rx));
    handle
}

struct ProxyToServerConnection {
    host_and_port: String,
    server_host_and_port: String,
    chained_host_and_port: Option<String>,
    addr: SocketAddr,
    tls: Option<Arc<ClientTlsContext>>,
    initial_request: RequestHead,
    is_connect: bool,
    client_address: SocketAddr,
    connection_id: u64,
    state: ConnectionState,
    config: Arc<ProxyConfig>,
    stats: Arc<ProxyStats>,
    events: mpsc::Sender<ServerEvent>,
    saturated: Arc<AtomicBool>,
}

enum ReadOutcome {
    Head(ResponseHead),
    Chunk(Chunk),
    Eof,
}

impl ProxyToServerConnection {
    fn flow_context(&self) -> FlowContext {
        FlowContext {
            client_address: self.client_address,
            transport: TransportProtocol::Tcp,
            server_host_and_port: self.server_host_and_port.clone(),
            chained_host_and_port: self.chained_host_and_port.clone(),
        }
    }

    fn build_flow(&self) -> ConnectionFlow {
        let mut flow = ConnectionFlow::new().then(ConnectionFlowStep::TcpConnect {
            addr: self.addr,
            connect_timeout: self.config.connect_timeout,
        });
        if let Some(context) = &self.tls {
            let server_name = self
                .host_and_port
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| self.host_and_port.clone());
            flow = flow.then(ConnectionFlowStep::StartTls {
                context: Arc::clone(context),
                server_name,
            });
        }
        if self.is_connect && self.chained_host_and_port.is_some() {
            flow = flow.then(ConnectionFlowStep::NegotiateConnectThroughChain {
                origin: self.server_host_and_port.clone(),
            });
        }
        flow
    }

    /// Resets flow state for another attempt against a different
    /// destination. The connection object and its registry entry survive.
    fn retry_connecting(&mut self, addr: SocketAddr, request: RequestHead) {
        self.addr = addr;
        self.chained_host_and_port = None;
        self.tls = None;
        self.initial_request = request;
        self.state = ConnectionState::Connecting;
    }

    async fn run(mut self, mut commands: mpsc::Receiver<ServerCommand>) {
        let mut queued: VecDeque<ServerCommand> = VecDeque::new();
        let mut replacement: Option<RequestHead> = None;

        let established = loop {
            match self.build_flow().run().await {
                Ok(established) => break Some(established),
                Err(failure) => {
                    warn!(
                        "Connection to {} failed while {}: {:#}",
                        self.addr, failure.last_state, failure.error
                    );
                    let was_chained = self.chained_host_and_port.is_some();
                    let delivered = self
                        .send_event(ServerEvent::ConnectFailed {
                            host_and_port: self.host_and_port.clone(),
                            connection_id: self.connection_id,
                            last_state: failure.last_state,
                            request: self.initial_request.clone(),
                            was_chained,
                        })
                        .await;
                    if !delivered {
                        break None;
                    }
                    // Park ordinary commands until the owner either
                    // retries us against a new address or lets go.
                    let retry = loop {
                        match commands.recv().await {
                            Some(ServerCommand::RetryConnect {
                                addr,
                                head,
                                original,
                            }) => break Some((addr, head, original)),
                            Some(ServerCommand::Disconnect) | None => break None,
                            Some(other) => queued.push_back(other),
                        }
                    };
                    match retry {
                        Some((addr, head, original)) => {
                            self.retry_connecting(addr, original);
                            replacement = head;
                        }
                        None => break None,
                    }
                }
            }
        };

        let Some(established) = established else {
            self.state = ConnectionState::Disconnected;
            let _ = self
                .events
                .send(ServerEvent::Disconnected {
                    host_and_port: self.host_and_port.clone(),
                    connection_id: self.connection_id,
                    had_connected: false,
                })
                .await;
            return;
        };

        self.stats.record_server_connection();
        debug!("Connection to server succeeded: {}", self.addr);
        let delivered = self
            .send_event(ServerEvent::ConnectSucceeded {
                host_and_port: self.host_and_port.clone(),
                connection_id: self.connection_id,
            })
            .await;
        if !delivered {
            return;
        }

        // A chain→direct retry supersedes the request head queued before
        // the chain failed; its body chunks are kept.
        if let Some(head) = replacement.take() {
            let original = match queued.pop_front() {
                Some(ServerCommand::Request { original, .. }) => original,
                Some(other) => {
                    queued.push_front(other);
                    self.initial_request.clone()
                }
                None => self.initial_request.clone(),
            };
            if !self.is_connect {
                queued.push_front(ServerCommand::Request { head, original });
            }
        }

        let EstablishedTransport { transport, leftover } = established;
        let (read_half, write_half) = tokio::io::split(transport);
        let mut reader = MessageReader::with_leftover(read_half, leftover);
        let mut writer = write_half;

        let result = if self.is_connect {
            self.state = ConnectionState::Tunneling;
            self.run_tunnel(&mut reader, &mut writer, &mut commands, &mut queued)
                .await
        } else {
            self.state = ConnectionState::AwaitingInitial;
            self.run_http(&mut reader, &mut writer, &mut commands, &mut queued)
                .await
        };
        if let Err(e) = result {
            debug!("Server connection to {} ended: {:#}", self.addr, e);
        }

        self.state = ConnectionState::Disconnected;
        let _ = self
            .events
            .send(ServerEvent::Disconnected {
                host_and_port: self.host_and_port.clone(),
                connection_id: self.connection_id,
                had_connected: true,
            })
            .await;
    }

    /// Relays HTTP traffic: commands from the client connection go out the
    /// socket, decoded responses come back as `Respond` events.
    async fn run_http(
        &mut self,
        reader: &mut MessageReader<ReadHalf<Transport>>,
        writer: &mut WriteHalf<Transport>,
        commands: &mut mpsc::Receiver<ServerCommand>,
        queued: &mut VecDeque<ServerCommand>,
    ) -> Result<()> {
        // Unmodified requests awaiting their responses, oldest first.
        let mut pending: VecDeque<RequestHead> = VecDeque::new();
        // The exchange whose response body is currently streaming.
        let mut exchange: Option<(RequestHead, ResponseHead)> = None;
        let mut body: Option<BodyState> = None;
        let mut request_chunked_out = false;

        while let Some(command) = queued.pop_front() {
            if !self
                .apply_command(command, writer, &mut pending, &mut request_chunked_out)
                .await?
            {
                return Ok(());
            }
        }

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        None => return Ok(()),
                        Some(command) => {
                            if !self
                                .apply_command(command, writer, &mut pending, &mut request_chunked_out)
                                .await?
                            {
                                return Ok(());
                            }
                        }
                    }
                }
                outcome = Self::read_step(reader, &mut body) => {
                    match outcome? {
                        ReadOutcome::Head(head) => {
                            let original = pending
                                .pop_front()
                                .context("response received without a pending request")?;
                            let kind = response_body_kind(&original.method, &head);
                            let delivered = self
                                .send_respond(
                                    original.clone(),
                                    head.clone(),
                                    ResponsePayload::Head(head.clone()),
                                )
                                .await;
                            if !delivered {
                                return Ok(());
                            }
                            if kind != BodyKind::None {
                                body = Some(BodyState::new(kind));
                                exchange = Some((original, head));
                            }
                        }
                        ReadOutcome::Chunk(chunk) => {
                            self.record_bytes_from_server(chunk.data.len());
                            let last = chunk.last;
                            let (original, response) =
                                exchange.as_ref().context("body chunk without a response")?;
                            let delivered = self
                                .send_respond(
                                    original.clone(),
                                    response.clone(),
                                    ResponsePayload::Chunk(chunk),
                                )
                                .await;
                            if !delivered {
                                return Ok(());
                            }
                            if last {
                                body = None;
                                exchange = None;
                            }
                        }
                        ReadOutcome::Eof => return Ok(()),
                    }
                }
            }
        }
    }

    async fn read_step(
        reader: &mut MessageReader<ReadHalf<Transport>>,
        body: &mut Option<BodyState>,
    ) -> Result<ReadOutcome> {
        match body {
            Some(state) => Ok(ReadOutcome::Chunk(reader.read_body_chunk(state).await?)),
            None => Ok(match reader.read_response_head().await? {
                Some(head) => ReadOutcome::Head(head),
                None => ReadOutcome::Eof,
            }),
        }
    }

    /// Applies one command to the outbound socket. Returns false when the
    /// connection was asked to disconnect.
    async fn apply_command(
        &mut self,
        command: ServerCommand,
        writer: &mut WriteHalf<Transport>,
        pending: &mut VecDeque<RequestHead>,
        request_chunked_out: &mut bool,
    ) -> Result<bool> {
        match command {
            ServerCommand::Request { head, original } => {
                self.record_request_sent(&head);
                *request_chunked_out = is_chunked(&head.headers);
                writer.write_all(&encode_request_head(&head)).await?;
                writer.flush().await?;
                pending.push_back(original);
            }
            ServerCommand::BodyChunk(chunk) => {
                let encoded = encode_body_chunk(&chunk, *request_chunked_out);
                if !encoded.is_empty() {
                    writer.write_all(&encoded).await?;
                }
                if chunk.last {
                    writer.flush().await?;
                }
            }
            ServerCommand::Raw(data) => {
                writer.write_all(&data).await?;
                writer.flush().await?;
            }
            // Only meaningful while a connection flow is failing.
            ServerCommand::RetryConnect { .. } => {}
            ServerCommand::Disconnect => return Ok(false),
        }
        Ok(true)
    }

    /// Relays opaque tunnel bytes in both directions after a CONNECT.
    async fn run_tunnel(
        &mut self,
        reader: &mut MessageReader<ReadHalf<Transport>>,
        writer: &mut WriteHalf<Transport>,
        commands: &mut mpsc::Receiver<ServerCommand>,
        queued: &mut VecDeque<ServerCommand>,
    ) -> Result<()> {
        while let Some(command) = queued.pop_front() {
            match command {
                ServerCommand::Raw(data) => {
                    writer.write_all(&data).await?;
                    writer.flush().await?;
                }
                ServerCommand::Disconnect => return Ok(()),
                _ => {}
            }
        }
        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        None | Some(ServerCommand::Disconnect) => return Ok(()),
                        Some(ServerCommand::Raw(data)) => {
                            writer.write_all(&data).await?;
                            writer.flush().await?;
                        }
                        Some(_) => {}
                    }
                }
                data = reader.read_raw() => {
                    match data? {
                        Some(bytes) => {
                            self.record_bytes_from_server(bytes.len());
                            if !self.send_event(ServerEvent::TunnelData { data: bytes }).await {
                                return Ok(());
                            }
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn send_respond(
        &self,
        request: RequestHead,
        response: ResponseHead,
        payload: ResponsePayload,
    ) -> bool {
        self.send_event(ServerEvent::Respond {
            host_and_port: self.host_and_port.clone(),
            server_host_and_port: self.server_host_and_port.clone(),
            request,
            response,
            payload,
        })
        .await
    }

    /// Delivers an event to the owning client connection, tracking
    /// saturation while its bounded channel is full. Returns false when
    /// the client connection is gone.
    async fn send_event(&self, event: ServerEvent) -> bool {
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                self.saturated.store(true, Ordering::Relaxed);
                let delivered = self.events.send(event).await.is_ok();
                self.saturated.store(false, Ordering::Relaxed);
                delivered
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn record_request_sent(&self, request: &RequestHead) {
        if self.config.activity_trackers.is_empty() {
            return;
        }
        let context = self.flow_context();
        for tracker in &self.config.activity_trackers {
            tracker.request_sent(&context, request);
        }
    }

    fn record_bytes_from_server(&self, bytes: usize) {
        if self.config.activity_trackers.is_empty() {
            return;
        }
        let context = self.flow_context();
        for tracker in &self.config.activity_trackers {
            tracker.bytes_received_from_server(&context, bytes);
        }
    }
}
