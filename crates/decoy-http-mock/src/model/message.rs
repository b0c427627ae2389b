//! Request and response value types.

use super::headers::Headers;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// An HTTP request as seen by the dispatcher.
///
/// Values are immutable once built; `with_header` and friends return an
/// updated clone so a request can be re-shaped for forwarding without
/// touching the original.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: String,
    /// Forward over TLS when sent to an origin.
    #[serde(default)]
    pub secure: bool,
    /// Peer that sent the request; not part of the serialized form.
    #[serde(skip)]
    pub remote_socket: Option<SocketAddr>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn first_header(&self, name: &str) -> Option<&str> {
        self.headers.get_first(name)
    }

    pub fn host_header(&self) -> Option<&str> {
        self.headers.get_first("host")
    }

    /// Path plus query string, as it would appear in a request line.
    pub fn uri(&self) -> String {
        match &self.query {
            Some(q) if !q.is_empty() => format!("{}?{}", self.path, q),
            _ => self.path.clone(),
        }
    }
}

/// An HTTP response as produced by an action or an origin server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: String,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self {
            status: 200,
            headers: Headers::new(),
            body: String::new(),
        }
    }
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// The response for "no expectation matched and nothing was proxied".
    pub fn not_found() -> Self {
        Self::new(404)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn first_header(&self, name: &str) -> Option<&str> {
        self.headers.get_first(name)
    }
}
