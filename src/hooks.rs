//! Collaborator capabilities consumed by the connection state machines:
//! authentication, request/response filtering, chained-proxy policy, and
//! activity tracking. The proxy core only ever talks to these traits.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::codec::{RequestHead, ResponseHead};
use crate::tls::ClientTlsContext;

/// Transport used for an outbound leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Tcp,
}

/// Immutable record of one observed flow, delivered to activity trackers.
/// Carries no references into proxy state, so trackers can never perturb
/// the connection machinery.
#[derive(Debug, Clone)]
pub struct FlowContext {
    pub client_address: SocketAddr,
    pub transport: TransportProtocol,
    pub server_host_and_port: String,
    pub chained_host_and_port: Option<String>,
}

/// Verifies proxy credentials presented via `Proxy-Authorization: Basic`.
pub trait ProxyAuthenticator: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> bool;
}

/// Authenticator backed by a fixed credential pair.
pub struct StaticAuthenticator {
    username: String,
    password: String,
}

impl StaticAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl ProxyAuthenticator for StaticAuthenticator {
    fn authenticate(&self, username: &str, password: &str) -> bool {
        username == self.username && password == self.password
    }
}

/// Mutates outbound requests in place before they are written upstream.
pub trait RequestFilter: Send + Sync {
    fn filter(&self, request: &mut RequestHead);
}

/// Mutates response heads in place before they are relayed to the client.
pub trait ResponseFilter: Send + Sync {
    fn filter(&self, response: &mut ResponseHead);
}

/// Looks up the response filter to apply for a given origin, if any.
pub trait ResponseFilters: Send + Sync {
    fn get_filter(&self, host_and_port: &str) -> Option<Arc<dyn ResponseFilter>>;
}

/// Chained-proxy policy: decides per request whether to forward through an
/// upstream proxy instead of dialing the origin directly.
pub trait ChainProxyManager: Send + Sync {
    /// Chained proxy to use for this request, as "host:port". `None` means
    /// connect to the origin directly.
    fn host_and_port(&self, request: &RequestHead) -> Option<String>;

    fn transport_protocol(&self) -> TransportProtocol {
        TransportProtocol::Tcp
    }

    /// Whether the hop to the chained proxy must be TLS-encrypted.
    fn requires_tls(&self, _request: &RequestHead) -> bool {
        false
    }

    fn tls_context(&self) -> Option<Arc<ClientTlsContext>> {
        None
    }
}

/// Chain manager that sends every request through one fixed upstream.
pub struct StaticChainProxyManager {
    host_and_port: String,
}

impl StaticChainProxyManager {
    pub fn new(host_and_port: impl Into<String>) -> Self {
        Self {
            host_and_port: host_and_port.into(),
        }
    }
}

impl ChainProxyManager for StaticChainProxyManager {
    fn host_and_port(&self, _request: &RequestHead) -> Option<String> {
        Some(self.host_and_port.clone())
    }
}

/// Observes proxied traffic. All methods default to no-ops so trackers
/// implement only what they care about.
pub trait ActivityTracker: Send + Sync {
    fn request_received_from_client(&self, _context: &FlowContext, _request: &RequestHead) {}
    fn request_sent(&self, _context: &FlowContext, _request: &RequestHead) {}
    fn response_received(&self, _context: &FlowContext, _response: &ResponseHead) {}
    fn bytes_received_from_client(&self, _context: &FlowContext, _bytes: usize) {}
    fn bytes_received_from_server(&self, _context: &FlowContext, _bytes: usize) {}
}
