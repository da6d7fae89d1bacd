//! Command-line clients for a T2 workflow server.
//!
//! The library half drives a workflow run through its lifecycle
//! ([`lifecycle::RunDriver`]) and addresses values inside output ports
//! ([`port`]). The server itself is reached through the [`server::Server`]
//! and [`server::Run`] traits.

pub mod cancel;
pub mod cli;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod model;
pub mod port;
pub mod server;
mod text_summary;

pub use error::{Error, Result};
