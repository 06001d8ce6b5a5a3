//! Wire types for analysis requests and results
//!
//! Both types travel as UTF-8 JSON with camelCase field names. A result
//! carries every field of the request it answers, flattened at the top level.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Analysis request consumed from the request queue
///
/// # Examples
/// ```
/// use analysis_consumer::protocol::{AnalysisRequest, AnalysisType};
///
/// let json = r#"{
///     "id": "1",
///     "url": "http://example.org",
///     "requestTime": "2024-01-01T12:00:00Z",
///     "type": "SECURITY_HEADERS"
/// }"#;
/// let request: AnalysisRequest = serde_json::from_str(json).unwrap();
/// assert_eq!(request.analysis_type, AnalysisType::SecurityHeaders);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub id: String,
    /// Target to analyse
    pub url: String,
    /// Producers may omit it, decoding stamps the receive time
    #[serde(default = "Utc::now")]
    pub request_time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub analysis_type: AnalysisType,
}

impl AnalysisRequest {
    pub fn new(id: impl Into<String>, url: impl Into<String>, analysis_type: AnalysisType) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            request_time: Utc::now(),
            analysis_type,
        }
    }
}

/// Kind of analysis a request asks for
///
/// Unknown tags decode as [`AnalysisType::Unsupported`] so that the scanner
/// can turn them into a validation failure instead of the message failing
/// to parse and being redelivered forever.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisType {
    SecurityHeaders,
    Dnssec,
    #[serde(other)]
    Unsupported,
}

impl fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            AnalysisType::SecurityHeaders => "SECURITY_HEADERS",
            AnalysisType::Dnssec => "DNSSEC",
            AnalysisType::Unsupported => "UNSUPPORTED",
        };
        f.write_str(tag)
    }
}

/// Analysis result published to the result queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    #[serde(flatten)]
    pub request: AnalysisRequest,
    /// Raw scanner output, scanner specific
    pub raw_result: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub rating: Rating,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rating {
    /// Version of the rating rules that produced this rating
    pub version: String,
    pub score: Score,
    pub grade: Grade,
}

/// Letter grade attached to a rating
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Grade {
    A,
    B,
    C,
    D,
    E,
    F,
}

impl Grade {
    /// Grade band for a score: 90+ is A, then one letter per 15 points down to F
    pub fn from_score(score: Score) -> Self {
        match score.value() {
            90..=100 => Grade::A,
            75..=89 => Grade::B,
            60..=74 => Grade::C,
            45..=59 => Grade::D,
            30..=44 => Grade::E,
            _ => Grade::F,
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Numeric score, always within `0..=100`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(try_from = "i64", into = "u8")]
pub struct Score(u8);

#[derive(Debug, Error, PartialEq)]
#[error("Score must be between 0 and 100, got {0}")]
pub struct ScoreOutOfRange(pub i64);

impl Score {
    pub const MAX: Score = Score(100);
    pub const MIN: Score = Score(0);

    pub fn new(value: i64) -> Result<Self, ScoreOutOfRange> {
        if (0..=100).contains(&value) {
            Ok(Score(value as u8))
        } else {
            Err(ScoreOutOfRange(value))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Score {
    type Error = ScoreOutOfRange;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Score::new(value)
    }
}

impl From<Score> for u8 {
    fn from(score: Score) -> Self {
        score.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_request() -> AnalysisRequest {
        AnalysisRequest {
            id: "1".to_string(),
            url: "http://example.org".to_string(),
            request_time: "2024-01-01T12:00:00Z".parse().unwrap(),
            analysis_type: AnalysisType::SecurityHeaders,
        }
    }

    #[test]
    fn test_request_wire_field_names() {
        let value = serde_json::to_value(sample_request()).unwrap();

        assert_eq!(value["id"], "1");
        assert_eq!(value["url"], "http://example.org");
        assert_eq!(value["requestTime"], "2024-01-01T12:00:00Z");
        assert_eq!(value["type"], "SECURITY_HEADERS");
    }

    #[test]
    fn test_unknown_analysis_type_decodes_as_unsupported() {
        let request: AnalysisRequest = serde_json::from_value(json!({
            "id": "7",
            "url": "http://example.org",
            "requestTime": "2024-01-01T12:00:00Z",
            "type": "WHOIS"
        }))
        .unwrap();

        assert_eq!(request.analysis_type, AnalysisType::Unsupported);
    }

    #[test]
    fn test_request_time_defaults_when_absent() {
        let before = Utc::now();
        let request: AnalysisRequest = serde_json::from_value(json!({
            "id": "1",
            "url": "http://example.org",
            "type": "SECURITY_HEADERS"
        }))
        .unwrap();

        assert_eq!(request.analysis_type, AnalysisType::SecurityHeaders);
        assert!(request.request_time >= before);
    }

    #[test]
    fn test_request_missing_field_fails() {
        let result: Result<AnalysisRequest, _> = serde_json::from_value(json!({
            "id": "7",
            "type": "DNSSEC"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_result_flattens_request_fields() {
        let result = AnalysisResult {
            request: sample_request(),
            raw_result: "{}".to_string(),
            start_time: "2024-01-01T12:00:01Z".parse().unwrap(),
            end_time: "2024-01-01T12:00:02Z".parse().unwrap(),
            rating: Rating {
                version: "1.0".to_string(),
                score: Score::new(85).unwrap(),
                grade: Grade::B,
            },
        };

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["id"], "1");
        assert_eq!(value["type"], "SECURITY_HEADERS");
        assert_eq!(value["rawResult"], "{}");
        assert_eq!(value["startTime"], "2024-01-01T12:00:01Z");
        assert_eq!(value["rating"]["score"], 85);
        assert_eq!(value["rating"]["grade"], "B");
        assert_eq!(value["rating"]["version"], "1.0");
    }

    #[test]
    fn test_score_bounds() {
        assert!(Score::new(0).is_ok());
        assert!(Score::new(100).is_ok());
        assert_eq!(Score::new(101), Err(ScoreOutOfRange(101)));
        assert_eq!(Score::new(-1), Err(ScoreOutOfRange(-1)));
    }

    #[test]
    fn test_score_rejected_when_deserializing_out_of_range() {
        let rating: Result<Rating, _> = serde_json::from_value(json!({
            "version": "1.0",
            "score": 150,
            "grade": "A"
        }));
        assert!(rating.is_err());
    }

    #[test]
    fn test_grade_bands() {
        assert_eq!(Grade::from_score(Score::MAX), Grade::A);
        assert_eq!(Grade::from_score(Score::new(90).unwrap()), Grade::A);
        assert_eq!(Grade::from_score(Score::new(89).unwrap()), Grade::B);
        assert_eq!(Grade::from_score(Score::new(60).unwrap()), Grade::C);
        assert_eq!(Grade::from_score(Score::new(45).unwrap()), Grade::D);
        assert_eq!(Grade::from_score(Score::new(30).unwrap()), Grade::E);
        assert_eq!(Grade::from_score(Score::MIN), Grade::F);
    }
}
