//! Expectations and the first-match store.
//!
//! The matcher here is deliberately small: exact method, exact path, header
//! equality. Anything accepted by `matches` selects the expectation; the
//! first hit in insertion order wins.

use super::action::Action;
use super::headers::Headers;
use super::message::HttpRequest;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expectation {
    pub id: String,
    #[serde(rename = "match", default)]
    pub matcher: RequestMatcher,
    pub action: Action,
}

impl Expectation {
    pub fn new(id: impl Into<String>, matcher: RequestMatcher, action: Action) -> Self {
        Self {
            id: id.into(),
            matcher,
            action,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMatcher {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Headers::is_empty")]
    pub headers: Headers,
}

impl RequestMatcher {
    pub fn method_and_path(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: Some(method.into()),
            path: Some(path.into()),
            headers: Headers::new(),
        }
    }

    /// An empty matcher accepts everything.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn matches(&self, request: &HttpRequest) -> bool {
        if let Some(method) = &self.method {
            if !method.eq_ignore_ascii_case(&request.method) {
                return false;
            }
        }
        if let Some(path) = &self.path {
            if path != &request.path {
                return false;
            }
        }
        self.headers
            .iter()
            .all(|(name, value)| request.headers.contains_value(name, value))
    }
}

/// Read-mostly store of expectations, scanned in insertion order.
#[derive(Default)]
pub struct ExpectationStore {
    expectations: RwLock<Vec<Expectation>>,
}

impl ExpectationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_expectations(expectations: Vec<Expectation>) -> Self {
        Self {
            expectations: RwLock::new(expectations),
        }
    }

    pub fn add(&self, expectation: Expectation) {
        self.expectations.write().push(expectation);
    }

    pub fn first_matching(&self, request: &HttpRequest) -> Option<Expectation> {
        self.expectations
            .read()
            .iter()
            .find(|e| e.matcher.matches(request))
            .cloned()
    }

    pub fn clear(&self) {
        self.expectations.write().clear();
    }

    pub fn len(&self) -> usize {
        self.expectations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.expectations.read().is_empty()
    }
}
