//! AMQP 0-9-1 transport over lapin

pub mod client;
pub mod connection;

pub use client::{AmqpConnector, AmqpDelivery, AmqpSession};
pub use connection::{select_auth_mechanism, ConnectionOptions, Protocol};
