//! Per-message processing: decode, scan, publish, and the mapping from
//! outcome to acknowledgment

use crate::error::sanitize_error_message;
use crate::observability::MetricsCollector;
use crate::protocol::AnalysisRequest;
use crate::scanner::{ScanError, Scanner};
use crate::transport::{BrokerError, BrokerSession, Disposition};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// Why a message could not be processed
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Failed to decode analysis request: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Scan of {url} failed: {source}")]
    Scan {
        url: String,
        #[source]
        source: ScanError,
    },

    #[error("Failed to encode result for {url}: {source}")]
    Encode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to publish result for {url}: {source}")]
    Publish {
        url: String,
        #[source]
        source: BrokerError,
    },
}

impl ProcessingError {
    /// Request URL, when the payload got far enough to have one
    pub fn url(&self) -> Option<&str> {
        match self {
            ProcessingError::Decode(_) => None,
            ProcessingError::Scan { url, .. }
            | ProcessingError::Encode { url, .. }
            | ProcessingError::Publish { url, .. } => Some(url),
        }
    }

    /// Validation failures are permanent; malformed payloads are permanent
    /// only when `discard_malformed` is set. Everything else is retried.
    pub fn disposition(&self, discard_malformed: bool) -> Disposition {
        match self {
            ProcessingError::Scan {
                source: ScanError::Validation(_),
                ..
            } => Disposition::Reject,
            ProcessingError::Decode(_) if discard_malformed => Disposition::Reject,
            ProcessingError::Decode(_)
            | ProcessingError::Scan { .. }
            | ProcessingError::Encode { .. }
            | ProcessingError::Publish { .. } => Disposition::Requeue,
        }
    }
}

/// Total mapping from a processing outcome to the disposition to issue
pub fn disposition_for(
    outcome: &Result<(), ProcessingError>,
    discard_malformed: bool,
) -> Disposition {
    match outcome {
        Ok(()) => Disposition::Ack,
        Err(e) => e.disposition(discard_malformed),
    }
}

pub struct MessagePipeline {
    scanner: Arc<dyn Scanner>,
    result_queue: String,
    discard_malformed: bool,
    metrics: Arc<MetricsCollector>,
}

impl MessagePipeline {
    pub fn new(
        scanner: Arc<dyn Scanner>,
        result_queue: impl Into<String>,
        discard_malformed: bool,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            scanner,
            result_queue: result_queue.into(),
            discard_malformed,
            metrics,
        }
    }

    /// Decode the payload, scan it and publish the result through `session`
    pub async fn process<S: BrokerSession>(
        &self,
        session: &S,
        payload: &[u8],
    ) -> Result<(), ProcessingError> {
        let request: AnalysisRequest =
            serde_json::from_slice(payload).map_err(ProcessingError::Decode)?;
        info!(id = %request.id, "Received a request to scan: {}", request.url);

        let result = self
            .scanner
            .scan(&request)
            .await
            .map_err(|source| ProcessingError::Scan {
                url: request.url.clone(),
                source,
            })?;
        info!(
            id = %request.id,
            score = result.rating.score.value(),
            grade = %result.rating.grade,
            "Successfully scanned {}", request.url
        );

        let body = serde_json::to_vec(&result).map_err(|source| ProcessingError::Encode {
            url: request.url.clone(),
            source,
        })?;

        if let Err(source) = session.publish_persistent(&self.result_queue, &body).await {
            self.metrics.publish_failed();
            return Err(ProcessingError::Publish {
                url: request.url,
                source,
            });
        }
        self.metrics.result_published();
        info!(
            "Results of {} successfully sent to the '{}' queue",
            request.url, self.result_queue
        );

        Ok(())
    }

    /// Run [`Self::process`] and decide the disposition, logging failures
    pub async fn handle<S: BrokerSession>(
        &self,
        session: &S,
        payload: &[u8],
    ) -> Disposition {
        let outcome = self.process(session, payload).await;
        let disposition = disposition_for(&outcome, self.discard_malformed);

        if let Err(e) = &outcome {
            let message = sanitize_error_message(&e.to_string());
            match disposition {
                Disposition::Reject => warn!(
                    url = e.url().unwrap_or("<unknown>"),
                    error = %message,
                    "Discarding message that can never be processed"
                ),
                _ => error!(
                    url = e.url().unwrap_or("<unknown>"),
                    error = %message,
                    "Failed to process message"
                ),
            }
        }

        disposition
    }
}
