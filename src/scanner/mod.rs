//! Analysis engine seam
//!
//! The consumer only knows a scanner through [`Scanner::scan`]. Failures are
//! split into two kinds because the acknowledgment policy depends on it: a
//! validation failure is permanent and the message is discarded, anything
//! else is assumed transient and the message is redelivered.

use crate::protocol::{AnalysisRequest, AnalysisResult};
use async_trait::async_trait;
use thiserror::Error;

pub mod http_headers;

pub use http_headers::{HttpHeadersScanner, HttpHeadersScannerConfig};

/// Stateless analysis capability
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(&self, request: &AnalysisRequest) -> Result<AnalysisResult, ScanError>;
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScanError {
    /// The request is not eligible for this scanner and never will be
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Scan failed: {0}")]
    Transient(String),
}

impl ScanError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::Transient(message.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ScanError::Validation(_))
    }
}
