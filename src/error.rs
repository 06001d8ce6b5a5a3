//! Top-level error type for the consumer
//!
//! Component errors ([`BrokerError`], [`ScanError`], [`ConfigError`]) are
//! defined next to the code that produces them and folded into
//! [`ConsumerError`] at the lifecycle boundary.

use crate::config::ConfigError;
use crate::transport::BrokerError;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Channel is not established")]
    ChannelNotEstablished,

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Scanner initialization failed: {message}")]
    ScannerInit { message: String },

    #[error("Shutdown failed: {message}")]
    Shutdown { message: String },

    #[error("Signal handler registration failed: {0}")]
    Signals(#[source] std::io::Error),
}

impl ConsumerError {
    pub fn scanner_init<S: Into<String>>(message: S) -> Self {
        Self::ScannerInit {
            message: message.into(),
        }
    }

    pub fn shutdown<S: Into<String>>(message: S) -> Self {
        Self::Shutdown {
            message: message.into(),
        }
    }

    /// Message safe to write to the logs
    pub fn sanitized(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

pub type ConsumerResult<T> = Result<T, ConsumerError>;

const MAX_MESSAGE_LEN: usize = 500;

fn secret_pairs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(password|passwd|token|key|secret)[=:]\s*[^\s&]+")
            .expect("secret pattern is a valid regex")
    })
}

fn uri_credentials() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(amqps?|https?)://([^:/@\s]+):([^@\s]+)@")
            .expect("uri credential pattern is a valid regex")
    })
}

/// Redact credentials from an error message and cap its length
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = uri_credentials().replace_all(message, "${1}://${2}:***@");
    let mut sanitized = secret_pairs()
        .replace_all(&sanitized, "${1}=***")
        .into_owned();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(suffix);
    }

    sanitized
}
