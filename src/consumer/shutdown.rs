//! Graceful shutdown coordination
//!
//! [`ShutdownSignal`] is the one-way flag shared by the run loop, the
//! delivery handler and the coordinator. [`AnalysisConsumer::shutdown`]
//! drains in-flight work and tears the connection down.
//! [`TerminationSignals`] turns SIGINT, SIGTERM and SIGQUIT into shutdown
//! requests for the binary.

use super::lifecycle::{AnalysisConsumer, ConsumerState};
use crate::error::{sanitize_error_message, ConsumerError, ConsumerResult};
use crate::transport::{BrokerConnector, BrokerSession};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    /// Flag set, in-flight work still settling
    Draining,
    /// Connection torn down
    Closed,
}

/// Shutdown flag that can only be set once and never resets
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    triggered: Arc<AtomicBool>,
    phase: Arc<watch::Sender<ShutdownPhase>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ShutdownPhase::Running);
        Self {
            triggered: Arc::new(AtomicBool::new(false)),
            phase: Arc::new(tx),
        }
    }

    /// Set the flag; returns false if it was already set
    pub fn trigger(&self) -> bool {
        let first = self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if first {
            self.phase.send_replace(ShutdownPhase::Draining);
        }
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    pub(crate) fn mark_closed(&self) {
        self.phase.send_replace(ShutdownPhase::Closed);
    }

    /// Sleep for `delay` unless shutdown is requested first.
    /// Returns true if the full delay elapsed.
    pub async fn sleep(&self, delay: Duration) -> bool {
        let mut rx = self.phase.subscribe();
        tokio::select! {
            _ = rx.wait_for(|phase| *phase != ShutdownPhase::Running) => {
                info!("Shutdown requested during reconnection delay, stopping");
                false
            }
            _ = tokio::time::sleep(delay) => !self.is_triggered(),
        }
    }

    /// Resolves once the connection has been torn down
    pub async fn closed(&self) {
        let mut rx = self.phase.subscribe();
        let _ = rx.wait_for(|phase| *phase == ShutdownPhase::Closed).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: BrokerConnector> AnalysisConsumer<C> {
    /// Stop accepting work, wait for in-flight messages to settle, then
    /// close the connection. Only the first call does anything.
    pub async fn shutdown(&self, reason: &str) -> ConsumerResult<()> {
        if !self.shutdown.trigger() {
            warn!(reason, "Shutdown already in progress, ignoring");
            return Ok(());
        }

        info!(reason, "Shutting down gracefully...");
        self.set_state(ConsumerState::ShuttingDown);

        info!(
            pending = self.in_flight.len(),
            "Waiting for pending scans to complete..."
        );
        self.in_flight.wait_idle().await;

        let active = self.session.lock().await.take();
        let outcome = match active {
            Some(active) => {
                info!("Closing connection to RabbitMQ server...");
                active.observer.detach();
                let closed = active.session.close().await;
                self.metrics.connection_closed();
                closed.map_err(|e| ConsumerError::shutdown(e.to_string()))
            }
            None => {
                info!("No open connection to close");
                Ok(())
            }
        };
        self.shutdown.mark_closed();

        match &outcome {
            Ok(()) => info!("Graceful shutdown complete."),
            Err(e) => error!(error = %sanitize_error_message(&e.to_string()), "Error during shutdown"),
        }
        outcome
    }
}

/// Process termination signals that all request the same graceful shutdown
pub struct TerminationSignals {
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
}

impl TerminationSignals {
    pub fn register() -> ConsumerResult<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).map_err(ConsumerError::Signals)?,
            terminate: signal(SignalKind::terminate()).map_err(ConsumerError::Signals)?,
            quit: signal(SignalKind::quit()).map_err(ConsumerError::Signals)?,
        })
    }

    /// Wait for the next signal and return its name
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.quit.recv() => "SIGQUIT",
        }
    }
}
