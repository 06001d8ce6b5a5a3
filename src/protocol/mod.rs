//! Message types exchanged over the request and result queues

pub mod messages;

pub use messages::*;
