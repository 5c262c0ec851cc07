use std::process::ExitStatus;
use thiserror::Error;

/// Problems found while turning configuration into channels.
///
/// None of these stop the daemon: the offending element is logged and
/// skipped, or its action is left inert.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid element '{spec}': {reason}")]
    InvalidElement { spec: String, reason: String },

    #[error("unknown command code '{0}'")]
    UnknownCommand(String),

    #[error("too many {kind} configured (limit {limit})")]
    CapacityExceeded { kind: &'static str, limit: usize },

    #[error("GPIO {0} is already in use")]
    PinInUse(u8),

    #[error("GPIO error: {0}")]
    Gpio(#[from] rppal::gpio::Error),

    #[error("settings file: {0}")]
    Settings(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn invalid(spec: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidElement {
            spec: spec.to_string(),
            reason: reason.into(),
        }
    }
}

/// A command that could not be delivered. Never fatal.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("server location not resolved yet")]
    NoServer,

    #[error("command fragment is not valid JSON: {0}")]
    InvalidFragment(#[source] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server answered with status {0}")]
    Status(u16),

    #[error("could not start script: {0}")]
    Script(#[source] std::io::Error),

    #[error("script exited with {0}")]
    ScriptFailed(ExitStatus),
}
