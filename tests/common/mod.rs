use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use fwdproxy::proxy::{ProxyConfig, ProxyServer, ProxyStats};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Starts a proxy on an ephemeral port, returning its address and stats.
pub async fn start_proxy(config: ProxyConfig) -> (SocketAddr, Arc<ProxyStats>) {
    let server = ProxyServer::new("127.0.0.1:0".parse().unwrap(), config);
    let stats = server.stats();
    let addr = server.start().await.unwrap();
    (addr, stats)
}

/// Scripted origin server: answers every request on every connection with
/// the same canned response and records what it received.
pub struct Origin {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
}

impl Origin {
    pub async fn start(response: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let task_requests = Arc::clone(&requests);
        let task_connections = Arc::clone(&connections);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                task_connections.fetch_add(1, Ordering::SeqCst);
                let requests = Arc::clone(&task_requests);
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    while let Some(text) = read_http_message(&mut socket, &mut buf).await {
                        requests.lock().unwrap().push(text);
                        if socket.write_all(response.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        Self {
            addr,
            requests,
            connections,
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// TCP server that echoes every byte back, for tunnel tests.
pub async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Hand-rolled HTTP client speaking raw bytes, so tests control exactly
/// what goes over the wire.
pub struct RawClient {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl RawClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: Vec::new(),
        }
    }

    pub async fn send(&mut self, data: &str) {
        self.stream.write_all(data.as_bytes()).await.unwrap();
    }

    /// Reads one response: the head plus a Content-Length body if declared.
    pub async fn read_response(&mut self) -> String {
        read_http_message(&mut self.stream, &mut self.buf)
            .await
            .expect("connection closed before a full response arrived")
    }

    /// Reads exactly `n` raw bytes, for tunneled data.
    pub async fn read_bytes(&mut self, n: usize) -> Vec<u8> {
        while self.buf.len() < n {
            let mut tmp = [0u8; 4096];
            let read = self.stream.read(&mut tmp).await.unwrap();
            assert_ne!(read, 0, "connection closed mid tunnel read");
            self.buf.extend_from_slice(&tmp[..read]);
        }
        self.buf.drain(..n).collect()
    }

    /// Reads one chunked response: the head plus body up to the zero-size
    /// terminator.
    pub async fn read_chunked_response(&mut self) -> String {
        loop {
            if let Some(pos) = find_subslice(&self.buf, b"0\r\n\r\n") {
                let text = String::from_utf8_lossy(&self.buf[..pos + 5]).to_string();
                self.buf.drain(..pos + 5);
                return text;
            }
            let mut tmp = [0u8; 4096];
            let n = self.stream.read(&mut tmp).await.unwrap();
            assert_ne!(n, 0, "connection closed mid chunked response");
            self.buf.extend_from_slice(&tmp[..n]);
        }
    }

    /// Reads everything until the peer closes the connection.
    pub async fn read_until_close(&mut self) -> String {
        let mut out: Vec<u8> = self.buf.drain(..).collect();
        let mut tmp = [0u8; 4096];
        loop {
            match self.stream.read(&mut tmp).await {
                Ok(0) | Err(_) => break,
                Ok(n) => out.extend_from_slice(&tmp[..n]),
            }
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

/// Reads one HTTP message (head plus a Content-Length or chunked body)
/// into a string. Returns `None` when the peer closed before a full
/// message arrived.
async fn read_http_message(socket: &mut TcpStream, buf: &mut Vec<u8>) -> Option<String> {
    let head_end = loop {
        if let Some(pos) = find_subslice(buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let mut tmp = [0u8; 4096];
        match socket.read(&mut tmp).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
        }
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let chunked = head.lines().any(|line| {
        line.split_once(':').map_or(false, |(name, value)| {
            name.trim().eq_ignore_ascii_case("transfer-encoding")
                && value.to_ascii_lowercase().contains("chunked")
        })
    });
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);
    let total = if chunked {
        loop {
            if let Some(pos) = find_subslice(&buf[head_end..], b"0\r\n\r\n") {
                break head_end + pos + 5;
            }
            let mut tmp = [0u8; 4096];
            match socket.read(&mut tmp).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => buf.extend_from_slice(&tmp[..n]),
            }
        }
    } else {
        head_end + content_length
    };
    while buf.len() < total {
        let mut tmp = [0u8; 4096];
        match socket.read(&mut tmp).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
        }
    }
    let text = String::from_utf8_lossy(&buf[..total]).to_string();
    buf.drain(..total);
    Some(text)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
