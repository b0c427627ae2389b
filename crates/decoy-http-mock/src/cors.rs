//! CORS preflight detection and response headers.

use crate::model::{HttpRequest, HttpResponse};

const ALLOWED_METHODS: &str = "CONNECT, DELETE, GET, HEAD, OPTIONS, POST, PUT, TRACE";
const ALLOWED_HEADERS: &str =
    "Allow, Content-Encoding, Content-Length, Content-Type, ETag, Expires, \
     Last-Modified, Location, Server, Vary, Authorization";

/// Which responses get CORS headers attached by the writer.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorsPolicy {
    pub for_api: bool,
    pub for_all_responses: bool,
}

impl CorsPolicy {
    pub fn enabled(&self) -> bool {
        self.for_api || self.for_all_responses
    }

    pub fn applies_to(&self, request: &HttpRequest) -> bool {
        self.for_all_responses || (self.for_api && is_preflight_request(request))
    }
}

/// A CORS preflight is an OPTIONS request announcing the method it intends
/// to use.
pub fn is_preflight_request(request: &HttpRequest) -> bool {
    request.method.eq_ignore_ascii_case("OPTIONS")
        && request.headers.contains("access-control-request-method")
}

/// Add CORS headers to `response`, leaving any the response already set.
pub fn add_cors_headers(response: &mut HttpResponse) {
    set_if_absent(response, "access-control-allow-origin", "*");
    set_if_absent(response, "access-control-allow-methods", ALLOWED_METHODS);
    set_if_absent(response, "access-control-allow-headers", ALLOWED_HEADERS);
    set_if_absent(response, "access-control-expose-headers", ALLOWED_HEADERS);
    set_if_absent(response, "access-control-max-age", "300");
}

fn set_if_absent(response: &mut HttpResponse, name: &str, value: &str) {
    if !response.headers.contains(name) {
        response.headers.add(name, value);
    }
}
