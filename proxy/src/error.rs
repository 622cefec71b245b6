//! Error types for the proxy

use std::net::SocketAddr;
use thiserror::Error;

/// Configuration could not be loaded or is invalid. Fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A mapping's acceptor could not start serving.
#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("Cannot resolve listener address {addr}: {source}")]
    Resolve {
        addr: String,
        source: std::io::Error,
    },

    #[error("Listener address {0} resolved to nothing")]
    Unresolved(String),

    #[error("Cannot listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// Telemetry delivery failures. Never surfaced to the relay.
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid telemetry endpoint {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Telemetry transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Telemetry backend rejected write with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Telemetry flush timed out")]
    FlushTimeout,

    #[error("Telemetry emitter is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ConfigError>;
