//! Testing utilities
//!
//! Mock broker and scanner implementations for exercising the consumer
//! without a running RabbitMQ or network access.

pub mod mocks;

pub use mocks::*;
