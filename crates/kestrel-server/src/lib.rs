//! # Kestrel Server Library
//!
//! Bootstrapping for the Kestrel job worker: layered configuration,
//! logging, store construction, handler registration, and graceful
//! shutdown.

pub mod app;
pub mod config;
pub mod error;
pub mod handlers;
pub mod startup;

pub use app::App;
pub use config::{AppConfig, ConfigLoader};
pub use error::{ServerError, ServerResult};
