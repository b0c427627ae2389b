//! Template rendering for `respond_template` / `forward_template` actions.
//!
//! The engine contract is a trait so richer engines can be plugged in; the
//! built-in engine substitutes `${request.*}` placeholders into the template
//! text and parses the result as a YAML message.
//!
//! Supported placeholders:
//!
//! - `${request.path}` / `${request.method}` / `${request.body}`
//! - `${request.query.<name>}` - query parameter value
//! - `${request.headers.<name>}` - header value (case-insensitive)

use crate::error::ActionError;
use crate::model::{HttpRequest, HttpResponse, Template};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

static PLACEHOLDER_REGEX: OnceLock<Regex> = OnceLock::new();

fn placeholder_regex() -> &'static Regex {
    PLACEHOLDER_REGEX.get_or_init(|| {
        Regex::new(r"\$\{request\.([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_-]*)?)\}")
            .unwrap()
    })
}

/// Renders a template against the incoming request.
pub trait TemplateEngine: Send + Sync {
    fn render_response(
        &self,
        template: &Template,
        request: &HttpRequest,
    ) -> Result<HttpResponse, ActionError>;

    fn render_request(
        &self,
        template: &Template,
        request: &HttpRequest,
    ) -> Result<HttpRequest, ActionError>;
}

/// The built-in `${request.*}` substitution engine.
#[derive(Debug, Default)]
pub struct PlaceholderTemplateEngine;

impl PlaceholderTemplateEngine {
    pub fn new() -> Self {
        Self
    }

    fn substitute(template: &Template, request: &HttpRequest) -> String {
        let data = RequestData::from_request(request);
        placeholder_regex()
            .replace_all(&template.text, |caps: &regex::Captures<'_>| {
                data.get(&caps[1]).unwrap_or_default()
            })
            .into_owned()
    }
}

impl TemplateEngine for PlaceholderTemplateEngine {
    fn render_response(
        &self,
        template: &Template,
        request: &HttpRequest,
    ) -> Result<HttpResponse, ActionError> {
        let rendered = Self::substitute(template, request);
        serde_yaml::from_str(&rendered).map_err(|e| ActionError::TemplateRender(e.to_string()))
    }

    fn render_request(
        &self,
        template: &Template,
        request: &HttpRequest,
    ) -> Result<HttpRequest, ActionError> {
        let rendered = Self::substitute(template, request);
        serde_yaml::from_str(&rendered).map_err(|e| ActionError::TemplateRender(e.to_string()))
    }
}

/// Request fields flattened for dotted-path lookup.
struct RequestData {
    method: String,
    path: String,
    body: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
}

impl RequestData {
    fn from_request(request: &HttpRequest) -> Self {
        let headers = request
            .headers
            .iter()
            .map(|(name, value)| (name.to_lowercase(), value.to_string()))
            .collect();
        Self {
            method: request.method.clone(),
            path: request.path.clone(),
            body: request.body.clone(),
            query: parse_query_string(request.query.as_deref()),
            headers,
        }
    }

    fn get(&self, path: &str) -> Option<String> {
        let parts: Vec<&str> = path.splitn(2, '.').collect();
        match parts.as_slice() {
            ["path"] => Some(self.path.clone()),
            ["method"] => Some(self.method.clone()),
            ["body"] => Some(self.body.clone()),
            ["query", name] => self.query.get(*name).cloned(),
            ["headers", name] => self.headers.get(&name.to_lowercase()).cloned(),
            _ => None,
        }
    }
}

/// Parse a query string into a map, percent-decoding values.
pub fn parse_query_string(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if let Some(q) = query {
        for pair in q.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                let decoded = urlencoding::decode(value).unwrap_or_default().to_string();
                params.insert(key.to_string(), decoded);
            }
        }
    }
    params
}
