//! Client side of the proxy: one `ClientToProxyConnection` per accepted
//! socket. The connection task owns the client transport, decodes requests,
//! runs the authentication gate, routes traffic to per-origin server
//! connections, and relays their responses back in order.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use base64::Engine as _;
use bytes::Bytes;
use http::header::{
    HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, DATE, PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
};
use http::StatusCode;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::codec::{
    encode_body_chunk, encode_response_head, is_chunked, request_body_kind, response_body_kind,
    BodyKind, BodyState, Chunk, MessageReader, RequestHead, RequestId, ResponseHead,
};
use crate::flow::ConnectionState;
use crate::hooks::{FlowContext, TransportProtocol};
use crate::proxy::{ProxyConfig, ProxyStats};
use crate::rewrite::{
    add_via, fix_response_version, http_date, identify_host_and_port, is_keep_alive,
    is_terminal_payload, response_keep_alive, rewrite_request, rewrite_response,
    should_close_client, should_close_server, split_host_and_port,
};
use crate::server::{
    self, ResponsePayload, ServerCommand, ServerConnectionSpec, ServerEvent, ServerHandle,
};
use crate::tls::Transport;

const EVENT_CHANNEL_CAPACITY: usize = 32;

const PROXY_AUTH_REALM: &str = "Restricted Files";

const PROXY_AUTH_BODY: &str = "<!DOCTYPE HTML \"-//IETF//DTD HTML 2.0//EN\">\n\
<html><head>\n\
<title>407 Proxy Authentication Required</title>\n\
</head><body>\n\
<h1>Proxy Authentication Required</h1>\n\
<p>This server could not verify that you\n\
are authorized to access the document\n\
requested.  Either you supplied the wrong\n\
credentials (e.g., bad password), or your\n\
browser doesn't understand how to supply\n\
the credentials required.</p>\n\
</body></html>\n";

/// One decoded unit of client input.
enum ClientMessage {
    Request(RequestHead),
    BodyChunk(Chunk),
    Raw(Bytes),
    Eof,
}

/// A command waiting for channel capacity on its server connection. At
/// most one is outstanding; client-socket reads stay paused until it is
/// delivered, while server events keep draining.
struct PendingCommand {
    key: String,
    command: ServerCommand,
}

/// Where body chunks read from the client are routed.
enum BodyTarget {
    Server(String),
    /// Body of a request that was answered locally (e.g. with a 407) and
    /// must be consumed without forwarding.
    Discard,
}

/// Runs one client connection to completion.
pub(crate) async fn run(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<ProxyConfig>,
    stats: Arc<ProxyStats>,
) -> Result<()> {
    let transport = match &config.server_tls {
        Some(context) => Transport::ServerTls(Box::new(context.accept(stream).await?)),
        None => Transport::Plain(stream),
    };
    let (read_half, write_half) = tokio::io::split(transport);
    let mut reader = MessageReader::new(read_half);
    let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let idle_timeout = config.idle_timeout;
    let mut connection = ClientToProxyConnection {
        peer,
        config,
        stats,
        state: ConnectionState::AwaitingInitial,
        writer: write_half,
        events: events_tx,
        servers: Vec::new(),
        retired: Vec::new(),
        current_server: None,
        current_context: None,
        current_response_chunked: false,
        body_target: None,
        pending: None,
        connecting: 0,
        connected: 0,
        authenticated: false,
        chain_disabled: HashSet::new(),
    };
    // Body framing of the request currently being read from the client.
    let mut client_body: Option<BodyState> = None;

    loop {
        if connection.state == ConnectionState::DisconnectRequested {
            break;
        }
        // Reads are paused while a server connection is being established
        // (which keeps requests ordered behind the connect) and while a
        // command is waiting for channel capacity.
        let has_pending = connection.pending.is_some();
        let can_read = !has_pending
            && connection.connecting == 0
            && matches!(
                connection.state,
                ConnectionState::AwaitingInitial
                    | ConnectionState::AwaitingProxyAuthentication
                    | ConnectionState::AwaitingChunk
                    | ConnectionState::Tunneling
            );
        let state = connection.state;
        tokio::select! {
            event = events_rx.recv() => {
                if let Some(event) = event {
                    connection.handle_event(event, &mut client_body).await?;
                }
            }
            // Delivery of a queued command runs as its own arm, so a slow
            // origin only suspends client-socket reads: server events and
            // the idle timer stay live.
            _ = connection.forward_pending(), if has_pending => {}
            message = read_client(&mut reader, state, &mut client_body), if can_read => {
                connection.handle_client_message(message?, &mut client_body).await?;
            }
            _ = tokio::time::sleep(idle_timeout) => {
                debug!("Client connection {} idle, disconnecting", peer);
                break;
            }
        }
    }

    connection.shutdown().await;
    Ok(())
}

/// Reads the next unit of client input according to the connection state:
/// opaque bytes while tunneling, body chunks while a request body is open,
/// request heads otherwise. Cancellation safe.
async fn read_client(
    reader: &mut MessageReader<ReadHalf<Transport>>,
    state: ConnectionState,
    body: &mut Option<BodyState>,
) -> Result<ClientMessage> {
    if state == ConnectionState::Tunneling {
        return Ok(match reader.read_raw().await? {
            Some(data) => ClientMessage::Raw(data),
            None => ClientMessage::Eof,
        });
    }
    if let Some(state) = body {
        return Ok(ClientMessage::BodyChunk(reader.read_body_chunk(state).await?));
    }
    Ok(match reader.read_request_head().await? {
        Some(head) => ClientMessage::Request(head),
        None => ClientMessage::Eof,
    })
}

struct ClientToProxyConnection {
    peer: SocketAddr,
    config: Arc<ProxyConfig>,
    stats: Arc<ProxyStats>,
    state: ConnectionState,
    writer: WriteHalf<Transport>,
    events: mpsc::Sender<ServerEvent>,
    /// Server connections by origin (or chained proxy) "host:port", at most
    /// one per key.
    servers: Vec<ServerHandle>,
    /// Handles displaced from the registry but not yet disconnected, kept so
    /// a client disconnect still cascades to them.
    retired: Vec<ServerHandle>,
    /// Registry key of the connection handling the current request.
    current_server: Option<String>,
    current_context: Option<FlowContext>,
    /// Framing of the response currently being relayed to the client.
    current_response_chunked: bool,
    body_target: Option<BodyTarget>,
    /// Command queued for a server connection whose channel was not yet
    /// reserved.
    pending: Option<PendingCommand>,
    connecting: usize,
    connected: usize,
    authenticated: bool,
    /// Requests for which chained proxying has been disabled after a failed
    /// chain connection.
    chain_disabled: HashSet<RequestId>,
}

impl ClientToProxyConnection {
    async fn handle_client_message(
        &mut self,
        message: ClientMessage,
        client_body: &mut Option<BodyState>,
    ) -> Result<()> {
        match message {
            ClientMessage::Request(request) => self.handle_request(request, client_body).await,
            ClientMessage::BodyChunk(chunk) => {
                self.record_bytes_from_client(chunk.data.len());
                let last = chunk.last;
                let target = match &self.body_target {
                    Some(BodyTarget::Server(key)) => Some(key.clone()),
                    Some(BodyTarget::Discard) | None => None,
                };
                if let Some(key) = target {
                    self.queue_command(key, ServerCommand::BodyChunk(chunk));
                }
                if last {
                    *client_body = None;
                    self.body_target = None;
                    if self.state == ConnectionState::AwaitingChunk {
                        self.state = if self.needs_authentication() {
                            ConnectionState::AwaitingProxyAuthentication
                        } else {
                            ConnectionState::AwaitingInitial
                        };
                    }
                }
                Ok(())
            }
            ClientMessage::Raw(data) => {
                self.record_bytes_from_client(data.len());
                if let Some(key) = self.current_server.clone() {
                    self.queue_command(key, ServerCommand::Raw(data));
                }
                Ok(())
            }
            ClientMessage::Eof => {
                debug!("Client {} closed the connection", self.peer);
                self.state = ConnectionState::DisconnectRequested;
                Ok(())
            }
        }
    }

    async fn handle_request(
        &mut self,
        mut request: RequestHead,
        client_body: &mut Option<BodyState>,
    ) -> Result<()> {
        debug!(
            "Received request from {}: {} {}",
            self.peer, request.method, request.target
        );
        let body_kind = request_body_kind(&request);

        if !self.authenticate(&mut request).await? {
            if body_kind != BodyKind::None {
                *client_body = Some(BodyState::new(body_kind));
                self.body_target = Some(BodyTarget::Discard);
                self.state = ConnectionState::AwaitingChunk;
            } else {
                self.state = ConnectionState::AwaitingProxyAuthentication;
            }
            return Ok(());
        }

        let Some(server_host_and_port) = identify_host_and_port(&request) else {
            warn!("No host and port found in request from {}", self.peer);
            return self.write_bad_gateway(&request).await;
        };

        let chained = self.chain_for(&request);
        let key = chained
            .clone()
            .unwrap_or_else(|| server_host_and_port.clone());
        let context = FlowContext {
            client_address: self.peer,
            transport: TransportProtocol::Tcp,
            server_host_and_port: server_host_and_port.clone(),
            chained_host_and_port: chained.clone(),
        };
        self.record_request_received(&context, &request);
        self.current_context = Some(context);
        self.current_server = Some(key.clone());

        let is_connect = request.is_connect();
        let original = request.clone();

        // Whether the hop carrying this request is a chained one, which
        // decides the target form used when rewriting. A reused connection
        // may have fallen back to a direct hop since it was opened.
        let mut chained_hop = chained.is_some();

        // A connection that fell back from the chain to a direct hop is
        // pinned to one origin; it can only carry requests for that origin.
        let reusable = !is_connect
            && self.servers.iter().any(|s| {
                s.host_and_port == key
                    && s.reusable()
                    && (s.chained || s.server_host_and_port == server_host_and_port)
            });
        if reusable {
            debug!("Reusing existing server connection to {}", key);
            self.stats.record_server_connection_reused();
            if let Some(handle) = self.server(&key) {
                chained_hop = handle.chained;
            }
        } else {
            // A CONNECT takes exclusive ownership of the client connection,
            // and a fallen-back connection cannot serve another origin;
            // either way an existing entry under this key is displaced.
            if let Some(pos) = self.servers.iter().position(|s| s.host_and_port == key) {
                self.retired.push(self.servers.remove(pos));
            }
            let Some((host, port)) = split_host_and_port(&key) else {
                warn!("Unusable host and port in request from {}: {}", self.peer, key);
                return self.write_bad_gateway(&request).await;
            };
            let addr = match self.config.resolver.resolve(&host, port).await {
                Ok(addr) => addr,
                Err(e) => {
                    warn!("Failed to resolve {}:{}: {:#}", host, port, e);
                    return self.write_bad_gateway(&request).await;
                }
            };
            let tls = match (&chained, &self.config.chain_proxy_manager) {
                (Some(_), Some(manager)) if manager.requires_tls(&request) => {
                    manager.tls_context()
                }
                _ => None,
            };
            let handle = server::spawn(
                ServerConnectionSpec {
                    host_and_port: key.clone(),
                    server_host_and_port,
                    chained_host_and_port: chained.clone(),
                    addr,
                    tls,
                    initial_request: original.clone(),
                    is_connect,
                    client_address: self.peer,
                },
                Arc::clone(&self.config),
                Arc::clone(&self.stats),
                self.events.clone(),
            );
            self.servers.push(handle);
            self.connecting += 1;
        }

        if is_connect {
            // Nothing is written upstream yet; the response to the CONNECT
            // is synthesized here once the server connection is up.
            self.state = ConnectionState::NegotiatingConnect;
            self.body_target = None;
            return Ok(());
        }

        let mut outbound = request;
        if !self.config.transparent {
            rewrite_request(&mut outbound, chained_hop, &self.config.via_host);
        }
        if let Some(filter) = &self.config.request_filter {
            filter.filter(&mut outbound);
        }
        self.queue_command(
            key.clone(),
            ServerCommand::Request {
                head: outbound,
                original,
            },
        );

        if body_kind != BodyKind::None {
            *client_body = Some(BodyState::new(body_kind));
            self.body_target = Some(BodyTarget::Server(key));
            self.state = ConnectionState::AwaitingChunk;
        } else {
            self.body_target = None;
            self.state = ConnectionState::AwaitingInitial;
        }
        Ok(())
    }

    async fn handle_event(
        &mut self,
        event: ServerEvent,
        _client_body: &mut Option<BodyState>,
    ) -> Result<()> {
        match event {
            ServerEvent::ConnectSucceeded { host_and_port, .. } => {
                self.connecting = self.connecting.saturating_sub(1);
                self.connected += 1;
                if self.state == ConnectionState::NegotiatingConnect {
                    self.write_connect_ok().await?;
                    self.state = ConnectionState::Tunneling;
                    debug!("Tunnel to {} established", host_and_port);
                }
                Ok(())
            }
            ServerEvent::ConnectFailed {
                host_and_port,
                connection_id,
                last_state,
                request,
                was_chained,
            } => {
                self.connecting = self.connecting.saturating_sub(1);
                if was_chained && self.chain_disabled.insert(request.id) {
                    if self.retry_direct(connection_id, &request).await? {
                        return Ok(());
                    }
                }
                warn!(
                    "Connection to server {} failed while {}",
                    host_and_port, last_state
                );
                self.remove_server(connection_id);
                self.write_bad_gateway(&request).await
            }
            ServerEvent::Respond {
                host_and_port,
                server_host_and_port,
                request,
                response,
                payload,
            } => {
                // Persistence is judged on the heads as received, before any
                // rewriting, with the protocol version corrected.
                let request_persistent = is_keep_alive(request.version, &request.headers);
                let response_persistent = response_keep_alive(&response);
                match payload {
                    ResponsePayload::Head(mut head) => {
                        fix_response_version(&mut head);
                        if !self.config.transparent {
                            rewrite_response(&mut head, &self.config.via_host);
                        }
                        if let Some(filters) = &self.config.response_filters {
                            if let Some(filter) = filters.get_filter(&server_host_and_port) {
                                filter.filter(&mut head);
                            }
                        }
                        self.record_response_received(&host_and_port, &server_host_and_port, &head);
                        let bodyless =
                            response_body_kind(&request.method, &head) == BodyKind::None;
                        self.current_response_chunked = is_chunked(&head.headers);
                        self.writer.write_all(&encode_response_head(&head)).await?;
                        if bodyless {
                            self.writer.flush().await?;
                        }
                        let terminal = is_terminal_payload(None, bodyless);
                        self.apply_close_policy(
                            &host_and_port,
                            request_persistent,
                            response_persistent,
                            terminal,
                        );
                    }
                    ResponsePayload::Chunk(chunk) => {
                        let encoded = encode_body_chunk(&chunk, self.current_response_chunked);
                        if !encoded.is_empty() {
                            self.writer.write_all(&encoded).await?;
                        }
                        // The bytes completing a streamed response must reach
                        // the client immediately.
                        if chunk.last {
                            self.writer.flush().await?;
                        }
                        let terminal = is_terminal_payload(Some(&chunk), false);
                        self.apply_close_policy(
                            &host_and_port,
                            request_persistent,
                            response_persistent,
                            terminal,
                        );
                    }
                }
                Ok(())
            }
            ServerEvent::TunnelData { data } => {
                self.writer.write_all(&data).await?;
                self.writer.flush().await?;
                Ok(())
            }
            ServerEvent::Disconnected {
                host_and_port,
                connection_id,
                had_connected,
            } => {
                debug!("Server connection to {} disconnected", host_and_port);
                self.remove_server(connection_id);
                if had_connected {
                    self.connected = self.connected.saturating_sub(1);
                    if self.connected == 0 && self.connecting == 0 {
                        self.state = ConnectionState::DisconnectRequested;
                    }
                }
                Ok(())
            }
        }
    }

    /// Falls back to a direct origin connection after the chained proxy was
    /// unreachable. The failed connection retries in place, keeping its
    /// registry entry. Returns false when no fallback is possible.
    async fn retry_direct(&mut self, connection_id: u64, request: &RequestHead) -> Result<bool> {
        let Some(origin) = identify_host_and_port(request) else {
            return Ok(false);
        };
        let Some((host, port)) = split_host_and_port(&origin) else {
            return Ok(false);
        };
        let addr = match self.config.resolver.resolve(&host, port).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Fallback resolution of {} failed: {:#}", origin, e);
                return Ok(false);
            }
        };
        info!(
            "Chained proxy unreachable, falling back to direct connection to {}",
            origin
        );
        let head = if request.is_connect() {
            None
        } else {
            let mut head = request.clone();
            if !self.config.transparent {
                rewrite_request(&mut head, false, &self.config.via_host);
            }
            Some(head)
        };
        let Some(handle) = self
            .servers
            .iter_mut()
            .find(|s| s.connection_id == connection_id)
        else {
            return Ok(false);
        };
        handle.chained = false;
        if handle
            .send(ServerCommand::RetryConnect {
                addr,
                head,
                original: request.clone(),
            })
            .await
            .is_err()
        {
            return Ok(false);
        }
        self.connecting += 1;
        Ok(true)
    }

    /// Queues one command for delivery to a server connection. Reads from
    /// the client socket stay paused until the slot is empty again, so
    /// commands to any one connection keep their order.
    fn queue_command(&mut self, key: String, command: ServerCommand) {
        if self.server(&key).is_some() {
            self.pending = Some(PendingCommand { key, command });
        }
    }

    /// Delivers the queued command once its server connection has channel
    /// capacity. Cancellation leaves the command queued; a vanished target
    /// drops it.
    async fn forward_pending(&mut self) {
        let Some(key) = self.pending.as_ref().map(|p| p.key.clone()) else {
            return;
        };
        let Some(handle) = self.servers.iter().find(|s| s.host_and_port == key) else {
            self.pending = None;
            return;
        };
        match handle.reserve().await {
            Ok(permit) => {
                if let Some(pending) = self.pending.take() {
                    permit.send(pending.command);
                }
            }
            Err(_) => self.pending = None,
        }
    }

    /// Close decisions after relaying one response unit. Dropping a handle
    /// closes its command channel, which the server connection treats as its
    /// disconnect signal.
    fn apply_close_policy(
        &mut self,
        key: &str,
        request_persistent: bool,
        response_persistent: bool,
        terminal: bool,
    ) {
        if should_close_server(request_persistent, response_persistent, terminal) {
            debug!("Closing server connection to {} after relaying response", key);
            self.servers.retain(|s| s.host_and_port != key);
        }
        if should_close_client(request_persistent, terminal) {
            debug!("Closing client connection {} after relaying response", self.peer);
            self.state = ConnectionState::DisconnectRequested;
        }
    }

    /// Authentication gate. Returns true when the request may proceed; a
    /// false return means a 407 has been written and the request is spent.
    async fn authenticate(&mut self, request: &mut RequestHead) -> Result<bool> {
        let Some(authenticator) = &self.config.authenticator else {
            return Ok(true);
        };
        if self.authenticated {
            return Ok(true);
        }
        let Some(value) = request.headers.get(PROXY_AUTHORIZATION) else {
            debug!("Client {} sent no proxy credentials, requesting them", self.peer);
            self.write_auth_required().await?;
            return Ok(false);
        };
        let accepted = match decode_basic_credentials(value) {
            Some((username, password)) => authenticator.authenticate(&username, &password),
            None => {
                error!(
                    "Could not decode Proxy-Authorization header from {}",
                    self.peer
                );
                true
            }
        };
        if !accepted {
            debug!("Client {} presented bad proxy credentials", self.peer);
            self.write_auth_required().await?;
            return Ok(false);
        }
        self.authenticated = true;
        request.headers.remove(PROXY_AUTHORIZATION);
        Ok(true)
    }

    fn needs_authentication(&self) -> bool {
        self.config.authenticator.is_some() && !self.authenticated
    }

    /// Chained proxy for this request, unless chaining has been disabled for
    /// it after a failed chain connection.
    fn chain_for(&self, request: &RequestHead) -> Option<String> {
        let manager = self.config.chain_proxy_manager.as_ref()?;
        if self.chain_disabled.contains(&request.id) {
            return None;
        }
        manager.host_and_port(request)
    }

    fn server(&self, key: &str) -> Option<&ServerHandle> {
        self.servers.iter().find(|s| s.host_and_port == key)
    }

    fn remove_server(&mut self, connection_id: u64) {
        self.servers.retain(|s| s.connection_id != connection_id);
        self.retired.retain(|s| s.connection_id != connection_id);
    }

    async fn write_connect_ok(&mut self) -> Result<()> {
        let mut head = ResponseHead::with_reason(StatusCode::OK, "Connection established");
        head.headers
            .insert(CONNECTION, HeaderValue::from_static("Keep-Alive"));
        head.headers.insert(
            HeaderName::from_static("proxy-connection"),
            HeaderValue::from_static("Keep-Alive"),
        );
        if !self.config.transparent {
            add_via(head.version, &mut head.headers, &self.config.via_host);
        }
        self.writer.write_all(&encode_response_head(&head)).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn write_auth_required(&mut self) -> Result<()> {
        let mut head = ResponseHead::with_reason(
            StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            "Proxy Authentication Required",
        );
        head.headers.insert(
            PROXY_AUTHENTICATE,
            HeaderValue::from_str(&format!("Basic realm=\"{}\"", PROXY_AUTH_REALM))?,
        );
        head.headers
            .insert(DATE, HeaderValue::from_str(&http_date())?);
        head.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=UTF-8"),
        );
        head.headers
            .insert(CONTENT_LENGTH, HeaderValue::from(PROXY_AUTH_BODY.len()));
        self.writer.write_all(&encode_response_head(&head)).await?;
        self.writer.write_all(PROXY_AUTH_BODY.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Answers a request that could not be forwarded and requests the
    /// connection be torn down.
    async fn write_bad_gateway(&mut self, request: &RequestHead) -> Result<()> {
        let body = format!("Bad Gateway: {}", request.target);
        let mut head = ResponseHead::new(StatusCode::BAD_GATEWAY);
        head.headers
            .insert(DATE, HeaderValue::from_str(&http_date())?);
        head.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=UTF-8"),
        );
        head.headers
            .insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        head.headers
            .insert(CONNECTION, HeaderValue::from_static("close"));
        self.writer.write_all(&encode_response_head(&head)).await?;
        self.writer.write_all(body.as_bytes()).await?;
        self.writer.flush().await?;
        self.state = ConnectionState::DisconnectRequested;
        Ok(())
    }

    fn record_request_received(&self, context: &FlowContext, request: &RequestHead) {
        for tracker in &self.config.activity_trackers {
            tracker.request_received_from_client(context, request);
        }
    }

    fn record_bytes_from_client(&self, bytes: usize) {
        if self.config.activity_trackers.is_empty() {
            return;
        }
        if let Some(context) = &self.current_context {
            for tracker in &self.config.activity_trackers {
                tracker.bytes_received_from_client(context, bytes);
            }
        }
    }

    fn record_response_received(
        &self,
        key: &str,
        server_host_and_port: &str,
        response: &ResponseHead,
    ) {
        if self.config.activity_trackers.is_empty() {
            return;
        }
        let chained = if key != server_host_and_port {
            Some(key.to_string())
        } else {
            None
        };
        let context = FlowContext {
            client_address: self.peer,
            transport: TransportProtocol::Tcp,
            server_host_and_port: server_host_and_port.to_string(),
            chained_host_and_port: chained,
        };
        for tracker in &self.config.activity_trackers {
            tracker.response_received(&context, response);
        }
    }

    /// Disconnecting the client cascades to every server connection, the
    /// displaced ones included.
    async fn shutdown(mut self) {
        self.state = ConnectionState::Disconnected;
        self.servers.clear();
        self.retired.clear();
        let _ = self.writer.shutdown().await;
    }
}

fn decode_basic_credentials(value: &HeaderValue) -> Option<(String, String)> {
    let text = value.to_str().ok()?;
    let encoded = text.trim().strip_prefix("Basic")?.trim();
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}
