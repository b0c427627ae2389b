//! The action attached to an expectation: what the server does when the
//! expectation's matcher accepts a request.

use super::headers::Headers;
use super::message::{HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay applied before a response is written, never before matching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delay {
    #[serde(default)]
    pub unit: TimeUnit,
    #[serde(default)]
    pub value: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    #[default]
    Milliseconds,
    Seconds,
}

impl Delay {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn milliseconds(value: u64) -> Self {
        Self {
            unit: TimeUnit::Milliseconds,
            value,
        }
    }

    pub fn seconds(value: u64) -> Self {
        Self {
            unit: TimeUnit::Seconds,
            value,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0
    }

    pub fn to_duration(&self) -> Duration {
        match self.unit {
            TimeUnit::Milliseconds => Duration::from_millis(self.value),
            TimeUnit::Seconds => Duration::from_secs(self.value),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

/// A template rendered against the incoming request. The rendered text is
/// parsed as a YAML message (response or request, depending on the action).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub text: String,
}

impl Template {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Field replacements applied over the original request before forwarding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Set-semantics: each named header replaces any original values.
    #[serde(default, skip_serializing_if = "Headers::is_empty")]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl RequestOverride {
    pub fn apply(&self, base: &HttpRequest) -> HttpRequest {
        let mut request = base.clone();
        if let Some(method) = &self.method {
            request.method = method.clone();
        }
        if let Some(path) = &self.path {
            request.path = path.clone();
        }
        if let Some(query) = &self.query {
            request.query = Some(query.clone());
        }
        for (name, value) in self.headers.iter() {
            request.headers.set(name, value);
        }
        if let Some(body) = &self.body {
            request.body = body.clone();
        }
        request
    }
}

/// Field replacements applied over the origin's response before it is
/// written back to the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Headers::is_empty")]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl ResponseOverride {
    pub fn apply(&self, base: HttpResponse) -> HttpResponse {
        let mut response = base;
        if let Some(status) = self.status {
            response.status = status;
        }
        for (name, value) in self.headers.iter() {
            response.headers.set(name, value);
        }
        if let Some(body) = &self.body {
            response.body = body.clone();
        }
        response
    }
}

/// A transport-level fault emitted instead of an HTTP response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaultBehavior {
    /// Raw bytes written to the socket as-is, bypassing the HTTP encoder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_bytes: Option<String>,
    #[serde(default)]
    pub drop_connection: bool,
}

/// The ten action kinds the dispatcher branches over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Return a canned response.
    Respond {
        response: HttpResponse,
        #[serde(default)]
        delay: Delay,
    },
    /// Render a template against the request to produce a response.
    RespondTemplate {
        template: Template,
        #[serde(default)]
        delay: Delay,
    },
    /// Invoke a named in-process callback to produce a response.
    RespondViaCallback { name: String },
    /// Round-trip to a remote callback client to obtain the response; the
    /// executor owns response completion.
    RespondViaRemote { client_id: String },
    /// Forward the request (minus hop-by-hop headers) to a target origin.
    Forward {
        host: String,
        port: u16,
        #[serde(default)]
        scheme: Scheme,
        #[serde(default)]
        delay: Delay,
    },
    /// Forward a request computed by rendering a template.
    ForwardTemplate {
        template: Template,
        #[serde(default)]
        delay: Delay,
    },
    /// Forward a request produced by a named in-process callback.
    ForwardViaCallback { name: String },
    /// Forward a request produced by a remote callback client.
    ForwardViaRemote { client_id: String },
    /// Forward the original request with field overrides, optionally
    /// transforming the origin's response.
    ForwardReplace {
        #[serde(default)]
        request_override: RequestOverride,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_override: Option<ResponseOverride>,
        #[serde(default)]
        delay: Delay,
    },
    /// Produce a transport-level fault instead of a response.
    Fault {
        behavior: FaultBehavior,
        #[serde(default)]
        delay: Delay,
    },
}

impl Action {
    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Respond { .. } => "respond",
            Action::RespondTemplate { .. } => "respond_template",
            Action::RespondViaCallback { .. } => "respond_via_callback",
            Action::RespondViaRemote { .. } => "respond_via_remote",
            Action::Forward { .. } => "forward",
            Action::ForwardTemplate { .. } => "forward_template",
            Action::ForwardViaCallback { .. } => "forward_via_callback",
            Action::ForwardViaRemote { .. } => "forward_via_remote",
            Action::ForwardReplace { .. } => "forward_replace",
            Action::Fault { .. } => "fault",
        }
    }
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Https)
    }
}
