//! Pure connection option handling for the AMQP transport
//!
//! Turns [`ConnectionOptions`] into the AMQP URI understood by lapin,
//! including heartbeat, connection timeout and SASL mechanism selection.

use crate::transport::BrokerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Transport scheme for the broker connection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Amqp,
    Amqps,
}

impl Protocol {
    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Amqp => "amqp",
            Protocol::Amqps => "amqps",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Amqp => 5672,
            Protocol::Amqps => 5671,
        }
    }
}

/// Broker connection parameters, immutable once the consumer starts
#[derive(Clone, PartialEq)]
pub struct ConnectionOptions {
    pub protocol: Protocol,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    /// Heartbeat interval in seconds, 0 disables heartbeats
    pub heartbeat_secs: u16,
    pub connection_timeout_ms: u64,
    /// Acceptable SASL mechanisms in order of preference
    pub auth_mechanisms: Vec<String>,
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("protocol", &self.protocol)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("vhost", &self.vhost)
            .field("heartbeat_secs", &self.heartbeat_secs)
            .field("connection_timeout_ms", &self.connection_timeout_ms)
            .field("auth_mechanisms", &self.auth_mechanisms)
            .finish()
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            protocol: Protocol::Amqp,
            hostname: "localhost".to_string(),
            port: Protocol::Amqp.default_port(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            heartbeat_secs: 30,
            connection_timeout_ms: 10_000,
            auth_mechanisms: vec![
                "PLAIN".to_string(),
                "AMQPLAIN".to_string(),
                "EXTERNAL".to_string(),
            ],
        }
    }
}

/// SASL mechanisms lapin can negotiate, keyed by their wire name
const SUPPORTED_MECHANISMS: &[(&str, &str)] = &[
    ("PLAIN", "plain"),
    ("AMQPLAIN", "amqplain"),
    ("EXTERNAL", "external"),
    ("ANONYMOUS", "anonymous"),
    ("RABBIT-CR-DEMO", "rabbit-cr-demo"),
];

/// Pick the first mechanism in preference order that lapin supports
pub fn select_auth_mechanism(preferred: &[String]) -> Result<&'static str, BrokerError> {
    preferred
        .iter()
        .find_map(|wanted| {
            SUPPORTED_MECHANISMS
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(wanted.trim()))
                .map(|(_, uri_value)| *uri_value)
        })
        .ok_or_else(|| {
            BrokerError::InvalidOptions(format!(
                "None of the authentication mechanisms {preferred:?} is supported"
            ))
        })
}

impl ConnectionOptions {
    /// Full AMQP URI including credentials
    pub fn to_uri(&self) -> Result<String, BrokerError> {
        self.build_uri(&self.password)
    }

    /// AMQP URI with the password masked, safe to log
    pub fn redacted_uri(&self) -> Result<String, BrokerError> {
        self.build_uri("***")
    }

    fn build_uri(&self, password: &str) -> Result<String, BrokerError> {
        if self.hostname.trim().is_empty() {
            return Err(BrokerError::InvalidOptions("hostname is empty".to_string()));
        }

        let base = format!("{}://{}:{}", self.protocol.scheme(), self.hostname, self.port);
        let mut url = Url::parse(&base)
            .map_err(|e| BrokerError::InvalidOptions(format!("invalid broker address '{base}': {e}")))?;

        url.set_username(&self.username)
            .map_err(|_| BrokerError::InvalidOptions("username cannot be set".to_string()))?;
        url.set_password(Some(password))
            .map_err(|_| BrokerError::InvalidOptions("password cannot be set".to_string()))?;

        // Path segment encoding: "/" travels as "%2F", spaces as "%20"
        if matches!(self.vhost.as_str(), "." | "..") {
            return Err(BrokerError::InvalidOptions(format!(
                "vhost '{}' cannot be expressed in an AMQP URI",
                self.vhost
            )));
        }
        url.path_segments_mut()
            .map_err(|_| BrokerError::InvalidOptions("vhost cannot be set".to_string()))?
            .clear()
            .push(&self.vhost);

        let mechanism = select_auth_mechanism(&self.auth_mechanisms)?;
        url.query_pairs_mut()
            .append_pair("heartbeat", &self.heartbeat_secs.to_string())
            .append_pair("connection_timeout", &self.connection_timeout_ms.to_string())
            .append_pair("auth_mechanism", mechanism);

        Ok(url.to_string())
    }
}
