//! Render a request as a `curl` command for forward log entries.

use crate::model::HttpRequest;
use std::net::SocketAddr;

/// Build a copy-pasteable `curl` invocation that reproduces `request`
/// against `remote` (falling back to the Host header for the authority).
pub fn to_curl(request: &HttpRequest, remote: Option<SocketAddr>) -> String {
    let authority = remote
        .map(|addr| addr.to_string())
        .or_else(|| request.host_header().map(str::to_string))
        .unwrap_or_else(|| "localhost".to_string());
    let scheme = if request.secure { "https" } else { "http" };

    let mut command = format!("curl -v '{}://{}{}'", scheme, authority, request.uri());

    if !request.method.is_empty() && !request.method.eq_ignore_ascii_case("GET") {
        command.push_str(&format!(" -X {}", request.method.to_uppercase()));
    }
    for (name, value) in request.headers.iter() {
        command.push_str(&format!(" -H '{}: {}'", name, value.replace('\'', "'\\''")));
    }
    if !request.body.is_empty() {
        command.push_str(&format!(" --data '{}'", request.body.replace('\'', "'\\''")));
    }
    command
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_requests_omit_the_method_flag() {
        let request = HttpRequest::new("GET", "/health");
        let curl = to_curl(&request, Some("127.0.0.1:8080".parse().unwrap()));
        assert_eq!(curl, "curl -v 'http://127.0.0.1:8080/health'");
    }

    #[test]
    fn test_non_get_requests_carry_method_headers_and_body() {
        let request = HttpRequest::new("POST", "/submit")
            .with_query("retry=1")
            .with_header("Content-Type", "application/json")
            .with_body(r#"{"a":1}"#);
        let curl = to_curl(&request, Some("10.1.2.3:9000".parse().unwrap()));
        assert!(curl.starts_with("curl -v 'http://10.1.2.3:9000/submit?retry=1' -X POST"));
        assert!(curl.contains("-H 'Content-Type: application/json'"));
        assert!(curl.contains(r#"--data '{"a":1}'"#));
    }

    #[test]
    fn test_authority_falls_back_to_host_header() {
        let request = HttpRequest::new("GET", "/").with_header("Host", "origin.example:81");
        let curl = to_curl(&request, None);
        assert!(curl.contains("'http://origin.example:81/'"));
    }

    #[test]
    fn test_secure_requests_render_https() {
        let mut request = HttpRequest::new("GET", "/");
        request.secure = true;
        let curl = to_curl(&request, Some("127.0.0.1:443".parse().unwrap()));
        assert!(curl.contains("'https://127.0.0.1:443/'"));
    }
}
