//! Header rewriting for proxied messages and the persistent-connection
//! close policy (RFC 2616 §8.1, §13.5.1, §14.10, §14.18).

use http::header::{HeaderName, HeaderValue, ACCEPT_ENCODING, CONNECTION, DATE, VIA};
use http::{HeaderMap, Method, Uri, Version};

use crate::codec::{is_chunked, Chunk, RequestHead, ResponseHead};

/// Hop-by-hop headers, meaningful for a single transport hop only
/// (RFC 2616 §13.5.1). Always stripped when forwarding.
pub const HOP_BY_HOP_HEADERS: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "upgrade",
];

const PROXY_CONNECTION: &str = "proxy-connection";

/// Rewrites a request before forwarding toward the origin. Skipped
/// entirely in transparent mode. When the request goes through a chained
/// proxy the absolute-URI target is kept, since the chain needs it.
pub fn rewrite_request(request: &mut RequestHead, chained: bool, via_host: &str) {
    if !chained {
        request.target = strip_host(&request.target);
    }
    remove_sdch_encoding(&mut request.headers);
    switch_proxy_connection_header(&mut request.headers);
    strip_connection_tokens(&mut request.headers);
    strip_hop_by_hop_headers(&mut request.headers);
    add_via(request.version, &mut request.headers, via_host);
}

/// Rewrites a response before relaying back to the client. Skipped
/// entirely in transparent mode.
pub fn rewrite_response(response: &mut ResponseHead, via_host: &str) {
    strip_connection_tokens(&mut response.headers);
    strip_hop_by_hop_headers(&mut response.headers);
    add_via(response.version, &mut response.headers, via_host);

    // RFC 2616 §14.18: a gatewayed message without a Date header must be
    // assigned one.
    if !response.headers.contains_key(DATE) {
        if let Ok(value) = HeaderValue::from_str(&http_date()) {
            response.headers.insert(DATE, value);
        }
    }
}

/// Turns "http://host.com/path" into "/path". A target that is already in
/// origin form is returned unchanged.
pub fn strip_host(target: &str) -> String {
    if !target.starts_with("http") {
        return target.to_string();
    }
    let after_scheme = match target.split_once("://") {
        Some((_, rest)) => rest,
        None => return target.to_string(),
    };
    match after_scheme.find('/') {
        Some(idx) => after_scheme[idx..].to_string(),
        None => "/".to_string(),
    }
}

/// Removes the sdch token from Accept-Encoding, since we cannot decode it.
fn remove_sdch_encoding(headers: &mut HeaderMap) {
    if let Some(value) = headers.get(ACCEPT_ENCODING).and_then(|v| v.to_str().ok()) {
        let kept: Vec<&str> = value
            .split(',')
            .map(str::trim)
            .filter(|t| !t.eq_ignore_ascii_case("sdch") && !t.is_empty())
            .collect();
        if let Ok(new_value) = HeaderValue::from_str(&kept.join(",")) {
            headers.insert(ACCEPT_ENCODING, new_value);
        }
    }
}

/// Renames the de-facto standard "Proxy-Connection" header to "Connection"
/// before passing the request along.
fn switch_proxy_connection_header(headers: &mut HeaderMap) {
    if let Some(value) = headers.remove(PROXY_CONNECTION) {
        headers.insert(CONNECTION, value);
    }
}

/// RFC 2616 §14.10: for each connection-token in the Connection header,
/// remove any header field with the same name.
fn strip_connection_tokens(headers: &mut HeaderMap) {
    let tokens: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    for token in tokens {
        if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
            headers.remove(name);
        }
    }
}

fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Appends a Via token of the form "<major>.<minor> <host>".
pub fn add_via(version: Version, headers: &mut HeaderMap, via_host: &str) {
    let token = format!("{} {}", version_number(version), via_host);
    if let Ok(value) = HeaderValue::from_str(&token) {
        headers.append(VIA, value);
    }
}

fn version_number(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "1.0"
    } else {
        "1.1"
    }
}

/// Current time formatted per RFC 1123 for HTTP Date headers.
pub fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Netty-compatible keep-alive test: "Connection: close" always closes;
/// HTTP/1.1 is otherwise persistent, HTTP/1.0 is persistent only with an
/// explicit keep-alive token.
pub fn is_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let mut keep_alive_token = false;
    for value in headers.get_all(CONNECTION) {
        if let Ok(text) = value.to_str() {
            for token in text.split(',') {
                let token = token.trim();
                if token.eq_ignore_ascii_case("close") {
                    return false;
                }
                if token.eq_ignore_ascii_case("keep-alive") {
                    keep_alive_token = true;
                }
            }
        }
    }
    if version == Version::HTTP_10 {
        keep_alive_token
    } else {
        true
    }
}

/// Chunked transfer is an HTTP/1.1 feature, but some origins declare a
/// chunked response as HTTP/1.0. The declared version is corrected without
/// touching the body.
pub fn fix_response_version(response: &mut ResponseHead) {
    if is_chunked(&response.headers) && response.version != Version::HTTP_11 {
        response.version = Version::HTTP_11;
    }
}

/// Keep-alive test for a response head, evaluated on the corrected
/// protocol version (a chunked response that mislabeled itself as 1.0 is
/// judged as 1.1).
pub fn response_keep_alive(response: &ResponseHead) -> bool {
    let version = if is_chunked(&response.headers) {
        Version::HTTP_11
    } else {
        response.version
    };
    is_keep_alive(version, &response.headers)
}

/// Close decision for one relayed unit (RFC 2616 §8.1). `terminal` is false
/// for middle pieces of a streamed body: nothing closes mid-stream.
pub fn should_close_server(
    request_keep_alive: bool,
    response_keep_alive: bool,
    terminal: bool,
) -> bool {
    if !terminal {
        return false;
    }
    !request_keep_alive || !response_keep_alive
}

/// Client-side close decision: the client socket closes only when the
/// client itself asked for the connection to be closed.
pub fn should_close_client(request_keep_alive: bool, terminal: bool) -> bool {
    if !terminal {
        return false;
    }
    !request_keep_alive
}

/// Whether a relayed payload is the terminal unit of its response.
pub fn is_terminal_payload(chunk: Option<&Chunk>, bodyless: bool) -> bool {
    match chunk {
        Some(c) => c.last,
        None => bodyless,
    }
}

/// Extracts "host:port" (port omitted when it is the scheme default) from
/// the request target, falling back to the Host header. CONNECT targets are
/// already in authority form.
pub fn identify_host_and_port(request: &RequestHead) -> Option<String> {
    if request.is_connect() {
        if request.target.is_empty() {
            return None;
        }
        return Some(request.target.clone());
    }
    if let Ok(uri) = request.target.parse::<Uri>() {
        if let Some(authority) = uri.authority() {
            return Some(authority.as_str().to_string());
        }
    }
    request
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.trim().to_string())
}

/// Splits "host:port" into its parts, defaulting the port to 80.
pub fn split_host_and_port(host_and_port: &str) -> Option<(String, u16)> {
    match host_and_port.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().ok()?;
            if host.is_empty() {
                return None;
            }
            Some((host.to_string(), port))
        }
        None => Some((host_and_port.to_string(), 80)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;
    use http::Method;

    fn request_with_headers(pairs: &[(&str, &str)]) -> RequestHead {
        let mut head = RequestHead::new(Method::GET, "http://example.com/path", Version::HTTP_11);
        for (name, value) in pairs {
            head.headers.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        head
    }

    #[test]
    fn strips_host_from_absolute_uri() {
        assert_eq!(strip_host("http://host.com/path?q=1"), "/path?q=1");
        assert_eq!(strip_host("https://host.com"), "/");
        assert_eq!(strip_host("/already/origin"), "/already/origin");
    }

    #[test]
    fn rewrite_strips_scheme_and_host_unless_chained() {
        let mut direct = request_with_headers(&[("host", "example.com")]);
        rewrite_request(&mut direct, false, "proxy.local");
        assert_eq!(direct.target, "/path");

        let mut chained = request_with_headers(&[("host", "example.com")]);
        rewrite_request(&mut chained, true, "proxy.local");
        assert_eq!(chained.target, "http://example.com/path");
    }

    #[test]
    fn removes_sdch_token_only() {
        let mut head = request_with_headers(&[("accept-encoding", "gzip, sdch, br")]);
        rewrite_request(&mut head, false, "proxy.local");
        assert_eq!(head.headers.get(ACCEPT_ENCODING).unwrap(), "gzip,br");
    }

    #[test]
    fn renames_proxy_connection_then_strips_it_as_hop_by_hop() {
        let mut head = request_with_headers(&[("proxy-connection", "keep-alive")]);
        rewrite_request(&mut head, false, "proxy.local");
        assert!(head.headers.get(PROXY_CONNECTION).is_none());
        assert!(head.headers.get(CONNECTION).is_none());
    }

    #[test]
    fn connection_tokens_delete_named_headers() {
        let mut head = request_with_headers(&[
            ("connection", "close, x-custom-hop"),
            ("x-custom-hop", "secret"),
            ("x-end-to-end", "kept"),
        ]);
        rewrite_request(&mut head, false, "proxy.local");
        assert!(head.headers.get("x-custom-hop").is_none());
        assert_eq!(head.headers.get("x-end-to-end").unwrap(), "kept");
    }

    #[test]
    fn strips_all_hop_by_hop_headers() {
        let mut head = request_with_headers(&[
            ("connection", "keep-alive"),
            ("keep-alive", "timeout=5"),
            ("proxy-authorization", "Basic abc"),
            ("te", "trailers"),
            ("upgrade", "websocket"),
        ]);
        rewrite_request(&mut head, false, "proxy.local");
        for name in HOP_BY_HOP_HEADERS {
            assert!(head.headers.get(name).is_none(), "{} survived", name);
        }
    }

    #[test]
    fn hop_by_hop_stripping_is_idempotent() {
        let mut once = request_with_headers(&[("connection", "close"), ("te", "trailers")]);
        rewrite_request(&mut once, false, "proxy.local");
        let mut twice = once.clone();
        // Rewriting appends another Via; drop it to compare the stripping.
        rewrite_request(&mut twice, false, "proxy.local");
        twice.headers.remove(VIA);
        once.headers.remove(VIA);
        assert_eq!(format!("{:?}", once.headers), format!("{:?}", twice.headers));
    }

    #[test]
    fn appends_exactly_one_via_token() {
        let mut head = request_with_headers(&[("via", "1.1 upstream")]);
        rewrite_request(&mut head, false, "proxy.local");
        let vias: Vec<_> = head.headers.get_all(VIA).iter().collect();
        assert_eq!(vias.len(), 2);
        assert_eq!(vias[1], &HeaderValue::from_static("1.1 proxy.local"));
    }

    #[test]
    fn synthesizes_date_only_when_missing() {
        let mut without = ResponseHead::new(http::StatusCode::OK);
        rewrite_response(&mut without, "proxy.local");
        assert_eq!(without.headers.get_all(DATE).iter().count(), 1);

        let mut with = ResponseHead::new(http::StatusCode::OK);
        let stamp = HeaderValue::from_static("Mon, 01 Jan 2024 00:00:00 GMT");
        with.headers.insert(DATE, stamp.clone());
        rewrite_response(&mut with, "proxy.local");
        assert_eq!(with.headers.get_all(DATE).iter().count(), 1);
        assert_eq!(with.headers.get(DATE).unwrap(), &stamp);
    }

    #[test]
    fn keep_alive_defaults_by_version() {
        let empty = HeaderMap::new();
        assert!(is_keep_alive(Version::HTTP_11, &empty));
        assert!(!is_keep_alive(Version::HTTP_10, &empty));

        let mut close = HeaderMap::new();
        close.insert(CONNECTION, HeaderValue::from_static("close"));
        assert!(!is_keep_alive(Version::HTTP_11, &close));

        let mut keep = HeaderMap::new();
        keep.insert(CONNECTION, HeaderValue::from_static("Keep-Alive"));
        assert!(is_keep_alive(Version::HTTP_10, &keep));
    }

    #[test]
    fn close_policy_table() {
        // (request ka, response ka, terminal) -> (close server, close client)
        let cases = [
            (true, true, false, false, false),
            (true, false, false, false, false),
            (false, true, false, false, false),
            (false, false, false, false, false),
            (true, true, true, false, false),
            (true, false, true, true, false),
            (false, true, true, true, true),
            (false, false, true, true, true),
        ];
        for (req_ka, resp_ka, terminal, server, client) in cases {
            assert_eq!(
                should_close_server(req_ka, resp_ka, terminal),
                server,
                "server close for {:?}",
                (req_ka, resp_ka, terminal)
            );
            assert_eq!(
                should_close_client(req_ka, terminal),
                client,
                "client close for {:?}",
                (req_ka, resp_ka, terminal)
            );
        }
    }

    #[test]
    fn chunked_http10_response_is_upgraded() {
        let mut head = ResponseHead::new(http::StatusCode::OK);
        head.version = Version::HTTP_10;
        head.headers.insert(
            http::header::TRANSFER_ENCODING,
            HeaderValue::from_static("chunked"),
        );
        fix_response_version(&mut head);
        assert_eq!(head.version, Version::HTTP_11);
    }

    #[test]
    fn identifies_host_and_port() {
        let absolute = request_with_headers(&[]);
        assert_eq!(identify_host_and_port(&absolute).unwrap(), "example.com");

        let mut connect = RequestHead::new(Method::CONNECT, "example.com:443", Version::HTTP_11);
        connect.headers.insert(
            http::header::HOST,
            HeaderValue::from_static("example.com:443"),
        );
        assert_eq!(identify_host_and_port(&connect).unwrap(), "example.com:443");

        let mut origin_form = RequestHead::new(Method::GET, "/path", Version::HTTP_11);
        origin_form.headers.insert(
            http::header::HOST,
            HeaderValue::from_static("fallback.example:8080"),
        );
        assert_eq!(
            identify_host_and_port(&origin_form).unwrap(),
            "fallback.example:8080"
        );

        let bare = RequestHead::new(Method::GET, "/path", Version::HTTP_11);
        assert!(identify_host_and_port(&bare).is_none());
    }

    #[test]
    fn splits_host_and_port_with_default() {
        assert_eq!(
            split_host_and_port("example.com:8080").unwrap(),
            ("example.com".to_string(), 8080)
        );
        assert_eq!(
            split_host_and_port("example.com").unwrap(),
            ("example.com".to_string(), 80)
        );
        assert!(split_host_and_port(":80").is_none());
    }
}
