//! Broker transport abstraction
//!
//! The consumer talks to the broker through three traits so that the
//! lifecycle logic can be exercised against the in-crate mocks:
//!
//! - [`BrokerConnector`] performs one connection attempt
//! - [`BrokerSession`] is a live connection with exactly one channel
//! - [`BrokerDelivery`] is an unacknowledged message
//!
//! The AMQP implementation lives in [`amqp`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod amqp;

pub use amqp::{AmqpConnector, ConnectionOptions};

/// Terminal outcome for a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processing finished, remove from the queue
    Ack,
    /// Negative acknowledgment with requeue, the broker redelivers
    Requeue,
    /// Reject without requeue, discarded or dead-lettered by broker policy
    Reject,
}

/// Unsolicited connection events reported by the observers
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Closed(String),
    Failed(String),
}

/// Close and error observers registered on a connection
///
/// Cloned into the transport's callbacks; the receiving half is held by the
/// reconnection engine. After [`ConnectionObserver::detach`] every
/// notification is dropped, which is how a deliberate close avoids
/// triggering a reconnect.
#[derive(Debug, Clone)]
pub struct ConnectionObserver {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
    attached: Arc<AtomicBool>,
}

impl ConnectionObserver {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                attached: Arc::new(AtomicBool::new(true)),
            },
            rx,
        )
    }

    pub fn on_close(&self, reason: impl Into<String>) {
        self.notify(ConnectionEvent::Closed(reason.into()));
    }

    pub fn on_error(&self, message: impl Into<String>) {
        self.notify(ConnectionEvent::Failed(message.into()));
    }

    /// Remove all observers from the connection
    pub fn detach(&self) {
        self.attached.store(false, Ordering::SeqCst);
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    fn notify(&self, event: ConnectionEvent) {
        if self.is_attached() {
            // Receiver gone means nobody is waiting for a reconnect anymore
            let _ = self.tx.send(event);
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Invalid connection options: {0}")]
    InvalidOptions(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Channel operation failed: {0}")]
    ChannelFailed(String),
    #[error("Publishing failed: {0}")]
    PublishFailed(String),
    #[error("Acknowledgment failed: {0}")]
    SettleFailed(String),
    #[error("Close failed: {0}")]
    CloseFailed(String),
}

pub type DeliveryStream<D> = BoxStream<'static, Result<D, BrokerError>>;

/// Single connection attempt against the broker
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    type Session: BrokerSession;

    /// Open a connection and one channel, wiring `observer` to the
    /// connection's close and error notifications
    async fn connect(
        &self,
        options: &ConnectionOptions,
        observer: ConnectionObserver,
    ) -> Result<Self::Session, BrokerError>;
}

/// Live connection and its channel
#[async_trait]
pub trait BrokerSession: Send + Sync + 'static {
    type Delivery: BrokerDelivery;

    async fn declare_durable_queue(&self, queue: &str) -> Result<(), BrokerError>;

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Subscribe with manual acknowledgment
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream<Self::Delivery>, BrokerError>;

    /// Publish to `queue` through the default exchange with persistent delivery
    async fn publish_persistent(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerDelivery: Send + Sync + 'static {
    fn payload(&self) -> &[u8];

    /// Whether the broker has delivered this message before
    fn redelivered(&self) -> bool;

    async fn settle(&self, disposition: Disposition) -> Result<(), BrokerError>;
}
