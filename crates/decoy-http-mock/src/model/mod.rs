//! Wire-facing value types: messages, headers, actions, expectations.

mod action;
mod expectation;
mod headers;
mod message;

pub use action::{
    Action, Delay, FaultBehavior, RequestOverride, ResponseOverride, Scheme, Template, TimeUnit,
};
pub use expectation::{Expectation, ExpectationStore, RequestMatcher};
pub use headers::Headers;
pub use message::{HttpRequest, HttpResponse};
