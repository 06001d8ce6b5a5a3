//! Analysis Consumer
//!
//! A long-running RabbitMQ consumer that takes analysis requests off a
//! durable queue, hands each one to a [`scanner::Scanner`], publishes the
//! result to a second durable queue and acknowledges the request.
//!
//! # Overview
//!
//! - Manual acknowledgment with a prefetch limit bounding concurrency
//! - Automatic reconnection with exponential backoff
//! - Graceful shutdown that drains in-flight scans before closing
//! - Pluggable broker transport, with an AMQP implementation on `lapin`
//!
//! # Quick Start
//!
//! ```rust
//! use analysis_consumer::protocol::{AnalysisRequest, AnalysisType};
//!
//! let request = AnalysisRequest::new("42", "https://example.org", AnalysisType::SecurityHeaders);
//! let json = serde_json::to_string(&request).unwrap();
//! assert!(json.contains("\"type\":\"SECURITY_HEADERS\""));
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod scanner;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, ConsumerConfig};
pub use consumer::{AnalysisConsumer, ConsumerSettings, ConsumerState};
pub use error::{ConsumerError, ConsumerResult};
pub use protocol::*;
pub use scanner::{ScanError, Scanner};
pub use transport::{BrokerError, Disposition};
