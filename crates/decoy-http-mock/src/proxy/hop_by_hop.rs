//! Strip hop-by-hop headers before a request transits the proxy.

use crate::model::HttpRequest;

/// Headers scoped to a single HTTP hop, per RFC 7230 §6.1.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Returns a copy of `request` without hop-by-hop headers, including any
/// header named in the inbound `Connection` header. The input is unchanged.
pub fn strip_hop_by_hop_headers(request: &HttpRequest) -> HttpRequest {
    let mut named_in_connection: Vec<String> = Vec::new();
    for value in request.headers.all("connection") {
        for token in value.split(',') {
            let token = token.trim();
            if !token.is_empty() {
                named_in_connection.push(token.to_ascii_lowercase());
            }
        }
    }

    let mut stripped = request.clone();
    for name in HOP_BY_HOP {
        stripped.headers.remove(name);
    }
    for name in &named_in_connection {
        stripped.headers.remove(name);
    }
    stripped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_hop_by_hop_headers_are_removed() {
        let request = HttpRequest::new("GET", "/")
            .with_header("Connection", "keep-alive")
            .with_header("Keep-Alive", "timeout=5")
            .with_header("Transfer-Encoding", "chunked")
            .with_header("Upgrade", "h2c")
            .with_header("Accept", "*/*");
        let stripped = strip_hop_by_hop_headers(&request);
        assert!(!stripped.headers.contains("connection"));
        assert!(!stripped.headers.contains("keep-alive"));
        assert!(!stripped.headers.contains("transfer-encoding"));
        assert!(!stripped.headers.contains("upgrade"));
        assert_eq!(stripped.first_header("accept"), Some("*/*"));
    }

    #[test]
    fn test_headers_named_in_connection_are_removed_too() {
        let request = HttpRequest::new("GET", "/")
            .with_header("Connection", "X-Session-Token, X-Trace")
            .with_header("X-Session-Token", "abc")
            .with_header("X-Trace", "t1")
            .with_header("X-Keep", "yes");
        let stripped = strip_hop_by_hop_headers(&request);
        assert!(!stripped.headers.contains("x-session-token"));
        assert!(!stripped.headers.contains("x-trace"));
        assert_eq!(stripped.first_header("x-keep"), Some("yes"));
    }

    #[test]
    fn test_input_request_is_unchanged() {
        let request = HttpRequest::new("GET", "/").with_header("Connection", "close");
        let _ = strip_hop_by_hop_headers(&request);
        assert!(request.headers.contains("connection"));
    }
}
