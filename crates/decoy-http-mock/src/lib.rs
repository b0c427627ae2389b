// Library exports for the decoy mock server.

// ===== Dispatch core =====
pub mod audit;
pub mod dispatch;
pub mod model;
pub mod scheduler;

// ===== Collaborators around the core =====
pub mod callback;
pub mod config;
pub mod cors;
pub mod curl;
pub mod error;
pub mod proxy;
pub mod template;
pub mod writer;

// ===== Front-end =====
pub mod server;

pub use config::Config;
pub use dispatch::Dispatcher;
pub use server::MockServer;
