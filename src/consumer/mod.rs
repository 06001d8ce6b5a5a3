//! Resilient queue consumer
//!
//! Wires the broker transport, the scanner and the acknowledgment policy
//! together, and keeps consuming across connection failures until a
//! graceful shutdown is requested.

pub mod backoff;
pub mod in_flight;
pub mod lifecycle;
pub mod pipeline;
pub mod shutdown;

pub use backoff::{AtMaxPolicy, ReconnectBackoff, ReconnectConfig};
pub use in_flight::{InFlightGuard, InFlightTracker};
pub use lifecycle::{AnalysisConsumer, ConsumerSettings, ConsumerState};
pub use pipeline::{disposition_for, MessagePipeline, ProcessingError};
pub use shutdown::{ShutdownPhase, ShutdownSignal, TerminationSignals};
