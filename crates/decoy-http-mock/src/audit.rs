//! Append-only audit log of matched, forwarded and unmatched requests.

use crate::model::{HttpRequest, HttpResponse};
use parking_lot::Mutex;
use serde::Serialize;

/// One recorded event. Timestamps are supplied at append time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEntry {
    /// A request that produced no response worth recording (unmatched).
    Request { request: HttpRequest, at: String },
    /// A request together with the response that was served for it.
    RequestResponse {
        request: HttpRequest,
        response: HttpResponse,
        at: String,
    },
    /// A request accepted by an expectation's matcher.
    ExpectationMatch {
        request: HttpRequest,
        expectation_id: String,
        at: String,
    },
}

/// Thread-safe sink. Per-request append order is the caller's program
/// order; no global order is promised across concurrent requests.
#[derive(Default)]
pub struct AuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn now() -> String {
        chrono::Utc::now().to_rfc3339()
    }

    pub fn request(&self, request: &HttpRequest) {
        self.entries.lock().push(AuditEntry::Request {
            request: request.clone(),
            at: Self::now(),
        });
    }

    pub fn request_response(&self, request: &HttpRequest, response: &HttpResponse) {
        self.entries.lock().push(AuditEntry::RequestResponse {
            request: request.clone(),
            response: response.clone(),
            at: Self::now(),
        });
    }

    pub fn expectation_match(&self, request: &HttpRequest, expectation_id: &str) {
        self.entries.lock().push(AuditEntry::ExpectationMatch {
            request: request.clone(),
            expectation_id: expectation_id.to_string(),
            at: Self::now(),
        });
    }

    pub fn snapshot(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
