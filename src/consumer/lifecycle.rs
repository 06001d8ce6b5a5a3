//! Consumer lifecycle: connect, consume, recover
//!
//! [`AnalysisConsumer::run`] drives the state machine
//!
//! ```text
//! Disconnected -> Connecting -> Consuming
//!                     |             |
//!                     v             v
//!               Reconnecting(delay) -> Connecting
//! ```
//!
//! with `ShuttingDown` reachable from any state and terminal. Only `run`
//! connects, so at most one connect/consumer-setup sequence is in progress.

use super::backoff::{ReconnectBackoff, ReconnectConfig};
use super::in_flight::InFlightTracker;
use super::pipeline::MessagePipeline;
use super::shutdown::ShutdownSignal;
use crate::error::{sanitize_error_message, ConsumerError, ConsumerResult};
use crate::observability::MetricsCollector;
use crate::scanner::Scanner;
use crate::transport::{
    BrokerConnector, BrokerDelivery, BrokerSession, ConnectionEvent, ConnectionObserver,
    ConnectionOptions, DeliveryStream, Disposition,
};
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type SessionDelivery<C> = <<C as BrokerConnector>::Session as BrokerSession>::Delivery;

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub connection: ConnectionOptions,
    /// Queue the analysis requests are consumed from
    pub queue: String,
    /// Queue the analysis results are published to
    pub result_queue: String,
    /// Maximum number of unacknowledged deliveries, which bounds concurrency
    pub prefetch: u16,
    /// Reject undecodable payloads instead of requeueing them
    pub discard_malformed: bool,
    pub reconnect: ReconnectConfig,
    pub consumer_tag_prefix: String,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            connection: ConnectionOptions::default(),
            queue: "analysis-requests".to_string(),
            result_queue: "analysis-results".to_string(),
            prefetch: 4,
            discard_malformed: false,
            reconnect: ReconnectConfig::default(),
            consumer_tag_prefix: "analysis-consumer".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Consuming,
    /// Waiting this long before the next connection attempt
    Reconnecting(Duration),
    ShuttingDown,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerState::Disconnected => write!(f, "disconnected"),
            ConsumerState::Connecting => write!(f, "connecting"),
            ConsumerState::Consuming => write!(f, "consuming"),
            ConsumerState::Reconnecting(delay) => {
                write!(f, "reconnecting in {}ms", delay.as_millis())
            }
            ConsumerState::ShuttingDown => write!(f, "shutting down"),
        }
    }
}

/// Live connection plus the observers registered on it
pub(super) struct ActiveSession<S> {
    pub(super) session: Arc<S>,
    pub(super) observer: ConnectionObserver,
}

/// Everything the consume loop needs from one successful setup
struct ReadyConsumer<S: BrokerSession> {
    session: Arc<S>,
    deliveries: DeliveryStream<S::Delivery>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

#[derive(Debug)]
enum LoopExit {
    Lost(String),
    Shutdown,
}

pub struct AnalysisConsumer<C: BrokerConnector> {
    settings: ConsumerSettings,
    connector: C,
    pipeline: Arc<MessagePipeline>,
    backoff: Mutex<ReconnectBackoff>,
    state: watch::Sender<ConsumerState>,
    pub(super) shutdown: ShutdownSignal,
    pub(super) in_flight: InFlightTracker,
    pub(super) metrics: Arc<MetricsCollector>,
    pub(super) session: Mutex<Option<ActiveSession<C::Session>>>,
}

impl<C: BrokerConnector> AnalysisConsumer<C> {
    pub fn new(
        settings: ConsumerSettings,
        connector: C,
        scanner: Arc<dyn Scanner>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let pipeline = MessagePipeline::new(
            scanner,
            settings.result_queue.clone(),
            settings.discard_malformed,
            Arc::clone(&metrics),
        );
        let (state, _rx) = watch::channel(ConsumerState::Disconnected);

        Self {
            backoff: Mutex::new(ReconnectBackoff::new(settings.reconnect.clone())),
            settings,
            connector,
            pipeline: Arc::new(pipeline),
            state,
            shutdown: ShutdownSignal::new(),
            in_flight: InFlightTracker::new(),
            metrics,
            session: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Delay the next reconnection attempt would wait
    pub async fn reconnect_delay(&self) -> Duration {
        self.backoff.lock().await.current()
    }

    /// `ShuttingDown` is terminal; later transitions are ignored
    pub(super) fn set_state(&self, next: ConsumerState) {
        self.state.send_if_modified(|current| {
            if *current == next || *current == ConsumerState::ShuttingDown {
                return false;
            }
            debug!(from = %current, to = %next, "Consumer state transition");
            *current = next;
            true
        });
    }

    /// Connect, consume and reconnect until shutdown
    ///
    /// Connection failures never end the loop; they are logged and retried
    /// after the current backoff delay.
    pub async fn run(&self) -> ConsumerResult<()> {
        let mut retrying = false;

        while !self.shutdown.is_triggered() {
            self.set_state(ConsumerState::Connecting);
            self.metrics.connection_attempt();

            match self.establish().await {
                Ok(Some(ready)) => {
                    retrying = false;
                    self.backoff.lock().await.reset();
                    self.metrics.connection_established();
                    self.set_state(ConsumerState::Consuming);

                    match self.consume(ready).await {
                        LoopExit::Shutdown => break,
                        LoopExit::Lost(reason) => {
                            warn!(
                                reason = %sanitize_error_message(&reason),
                                "Connection to RabbitMQ closed. Attempting to reconnect..."
                            );
                            self.metrics.connection_lost();
                            self.discard_session().await;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    if self.shutdown.is_triggered() {
                        debug!(error = %e.sanitized(), "Connection attempt ended by shutdown");
                        break;
                    }
                    if retrying {
                        error!(error = %e.sanitized(), "Reconnection attempt failed");
                        self.backoff.lock().await.on_retry_failed();
                    } else {
                        error!(error = %e.sanitized(), "Failed to connect to RabbitMQ");
                    }
                    self.metrics.connection_failed();
                    self.discard_session().await;
                }
            }

            if self.shutdown.is_triggered() {
                break;
            }
            let delay = self.backoff.lock().await.current();
            self.set_state(ConsumerState::Reconnecting(delay));
            info!(
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to RabbitMQ in {}ms", delay.as_millis()
            );
            if !self.shutdown.sleep(delay).await {
                break;
            }
            retrying = true;
        }

        debug!("Consumer run loop finished");
        Ok(())
    }

    /// Single connection attempt followed by consumer setup.
    /// Returns `None` when shutdown began while connecting.
    async fn establish(&self) -> ConsumerResult<Option<ReadyConsumer<C::Session>>> {
        let (observer, events) = ConnectionObserver::channel();
        let session = self
            .connector
            .connect(&self.settings.connection, observer.clone())
            .await?;
        let session = Arc::new(session);

        {
            let mut slot = self.session.lock().await;
            if self.shutdown.is_triggered() {
                drop(slot);
                info!("Shutdown started while connecting, closing new connection");
                observer.detach();
                if let Err(e) = session.close().await {
                    warn!(error = %sanitize_error_message(&e.to_string()), "Failed to close connection");
                }
                return Ok(None);
            }
            *slot = Some(ActiveSession {
                session: Arc::clone(&session),
                observer,
            });
        }

        let deliveries = self.create_consumer().await?;
        Ok(Some(ReadyConsumer {
            session,
            deliveries,
            events,
        }))
    }

    /// Declare the queues, apply the prefetch limit and subscribe with
    /// manual acknowledgment on the live channel
    pub async fn create_consumer(&self) -> ConsumerResult<DeliveryStream<SessionDelivery<C>>> {
        let session = self
            .session
            .lock()
            .await
            .as_ref()
            .map(|active| Arc::clone(&active.session))
            .ok_or(ConsumerError::ChannelNotEstablished)?;

        session.declare_durable_queue(&self.settings.queue).await?;
        session
            .declare_durable_queue(&self.settings.result_queue)
            .await?;
        session.set_prefetch(self.settings.prefetch).await?;

        let consumer_tag = format!("{}-{}", self.settings.consumer_tag_prefix, Uuid::new_v4());
        let deliveries = session.consume(&self.settings.queue, &consumer_tag).await?;
        info!(
            prefetch = self.settings.prefetch,
            consumer_tag = %consumer_tag,
            "Consumer is now consuming messages from the '{}' queue", self.settings.queue
        );

        Ok(deliveries)
    }

    async fn consume(&self, ready: ReadyConsumer<C::Session>) -> LoopExit {
        let ReadyConsumer {
            session,
            mut deliveries,
            mut events,
        } = ready;

        loop {
            tokio::select! {
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => self.dispatch(&session, delivery).await,
                    Some(Err(e)) => return self.lost_unless_shutdown(format!("delivery stream failed: {e}")),
                    None => return self.lost_unless_shutdown("consumer stream ended".to_string()),
                },
                event = events.recv() => match event {
                    Some(ConnectionEvent::Failed(message)) => {
                        error!(
                            error = %sanitize_error_message(&message),
                            "Connection to RabbitMQ got an error"
                        );
                        return self.lost_unless_shutdown(message);
                    }
                    Some(ConnectionEvent::Closed(reason)) => return self.lost_unless_shutdown(reason),
                    None => return self.lost_unless_shutdown("connection observers dropped".to_string()),
                },
                _ = self.shutdown.closed() => return LoopExit::Shutdown,
            }
        }
    }

    fn lost_unless_shutdown(&self, reason: String) -> LoopExit {
        if self.shutdown.is_triggered() {
            LoopExit::Shutdown
        } else {
            LoopExit::Lost(reason)
        }
    }

    /// Hand one delivery to the pipeline in its own task
    ///
    /// The in-flight entry is registered before the shutdown flag is read,
    /// so the coordinator either sees the entry or this message is requeued.
    async fn dispatch(&self, session: &Arc<C::Session>, delivery: SessionDelivery<C>) {
        self.metrics.message_received();
        let guard = self.in_flight.register();

        if self.shutdown.is_triggered() {
            info!("Shutdown in progress, returning message to the queue unprocessed");
            match delivery.settle(Disposition::Requeue).await {
                Ok(()) => self.metrics.requeued_during_shutdown(),
                Err(e) => {
                    self.metrics.settle_failed();
                    warn!(error = %sanitize_error_message(&e.to_string()), "Failed to requeue message");
                }
            }
            drop(guard);
            return;
        }

        if delivery.redelivered() {
            debug!("Processing redelivered message");
        }

        let pipeline = Arc::clone(&self.pipeline);
        let session = Arc::clone(session);
        let metrics = Arc::clone(&self.metrics);
        metrics.processing_started();

        tokio::spawn(async move {
            let started = Instant::now();
            let disposition = pipeline.handle(session.as_ref(), delivery.payload()).await;

            match delivery.settle(disposition).await {
                Ok(()) => metrics.message_settled(disposition),
                Err(e) => {
                    metrics.settle_failed();
                    error!(
                        ?disposition,
                        error = %sanitize_error_message(&e.to_string()),
                        "Failed to settle message"
                    );
                }
            }
            metrics.processing_finished(started.elapsed());
            drop(guard);
        });
    }

    /// Drop a dead or half-built connection before the next attempt.
    /// During shutdown the coordinator owns teardown instead.
    async fn discard_session(&self) {
        if self.shutdown.is_triggered() {
            return;
        }
        let Some(active) = self.session.lock().await.take() else {
            return;
        };
        active.observer.detach();
        if let Err(e) = active.session.close().await {
            debug!(error = %sanitize_error_message(&e.to_string()), "Discarded connection did not close cleanly");
        }
    }
}
