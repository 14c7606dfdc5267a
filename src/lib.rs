//! HTTP gateway that runs a script per request and streams its stdout back.

pub mod args;
pub mod config;
pub mod error;
pub mod http;
pub mod launcher;
pub mod relay;
pub mod resolver;
pub mod router;
pub mod server;

pub use config::Config;
pub use server::Server;
