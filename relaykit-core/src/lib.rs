//! Ambient building blocks shared by the relaykit crates: layered
//! configuration, structured logging bootstrap and the config error type.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod logging;

pub use bootstrap::load_config;
pub use config::{Config, LoggingConfig, PubSubConfig, ServerConfig};
pub use error::{Error, Result};
