//! HTTP security headers scanner
//!
//! Fetches the target URL once and rates the response by which of the
//! recommended security headers it carries. Required headers weigh twice as
//! much as optional ones.

use super::{ScanError, Scanner};
use crate::protocol::{AnalysisRequest, AnalysisResult, AnalysisType, Grade, Rating, Score};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Version stamped on every rating this scanner produces
pub const RATING_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Recommendation {
    Must,
    May,
}

impl Recommendation {
    fn weight(self) -> u32 {
        match self {
            Recommendation::Must => 2,
            Recommendation::May => 1,
        }
    }
}

/// Headers checked on every response, lower-cased
pub const RECOMMENDED_HEADERS: &[(&str, Recommendation)] = &[
    ("x-content-type-options", Recommendation::Must),
    ("x-frame-options", Recommendation::Must),
    ("strict-transport-security", Recommendation::Must),
    ("content-security-policy", Recommendation::Must),
    ("referrer-policy", Recommendation::May),
    ("permissions-policy", Recommendation::May),
];

#[derive(Debug, Clone)]
pub struct HttpHeadersScannerConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpHeadersScannerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: format!("analysis-consumer/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

pub struct HttpHeadersScanner {
    client: reqwest::Client,
}

impl HttpHeadersScanner {
    pub fn new(config: HttpHeadersScannerConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()?;
        Ok(Self { client })
    }

    /// Reject requests this scanner can never serve (pure function)
    fn validate(request: &AnalysisRequest) -> Result<Url, ScanError> {
        if request.analysis_type != AnalysisType::SecurityHeaders {
            return Err(ScanError::validation(format!(
                "Invalid request type: {}",
                request.analysis_type
            )));
        }

        let url = Url::parse(&request.url)
            .map_err(|e| ScanError::validation(format!("Invalid URL '{}': {e}", request.url)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            scheme => Err(ScanError::validation(format!(
                "Unsupported URL scheme '{scheme}' in '{}'",
                request.url
            ))),
        }
    }

    /// Rate a set of lower-cased response header names (pure function)
    pub fn rate(headers: &BTreeMap<String, String>) -> Rating {
        let total: u32 = RECOMMENDED_HEADERS.iter().map(|(_, r)| r.weight()).sum();
        let present: u32 = RECOMMENDED_HEADERS
            .iter()
            .filter(|(name, _)| headers.contains_key(*name))
            .map(|(_, r)| r.weight())
            .sum();

        // present <= total, so the percentage is always in range
        let score = Score::new(i64::from(present * 100 / total)).unwrap_or(Score::MIN);
        Rating {
            version: RATING_VERSION.to_string(),
            score,
            grade: Grade::from_score(score),
        }
    }
}

#[async_trait]
impl Scanner for HttpHeadersScanner {
    async fn scan(&self, request: &AnalysisRequest) -> Result<AnalysisResult, ScanError> {
        let url = Self::validate(request)?;
        info!(url = %request.url, id = %request.id, "Starting HTTP security headers scan");

        let start_time = Utc::now();
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ScanError::transient(format!("Request to {} failed: {e}", request.url)))?;

        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_lowercase(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        debug!(status = response.status().as_u16(), headers = headers.len(), "Response received");

        let raw_result = serde_json::to_string(&headers)
            .map_err(|e| ScanError::transient(format!("Failed to encode headers: {e}")))?;
        let rating = Self::rate(&headers);

        Ok(AnalysisResult {
            request: request.clone(),
            raw_result,
            start_time,
            end_time: Utc::now(),
            rating,
        })
    }
}
