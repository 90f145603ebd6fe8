//! Analysis oracle.
//!
//! The oracle is an opaque request/response function: one still image in,
//! one `AnalysisVerdict` out. Every failure mode collapses into
//! `OracleError` and is treated uniformly as "analysis unavailable"; calls
//! are never retried.

mod http;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::{HttpOracle, DEFAULT_ORACLE_TIMEOUT};

/// Structured verdict returned by the oracle (camelCase on the wire).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisVerdict {
    pub technical_details: String,
    pub anomaly_grade: String,
    #[serde(default)]
    pub database_comparisons: String,
    pub probability_of_genuine_event: f64,
    pub summary: String,
}

impl AnalysisVerdict {
    pub fn validate(self) -> Result<Self, OracleError> {
        let p = self.probability_of_genuine_event;
        if !(0.0..=1.0).contains(&p) {
            return Err(OracleError::Malformed(format!(
                "probabilityOfGenuineEvent {} outside [0, 1]",
                p
            )));
        }
        Ok(self)
    }
}

/// Encoded still frame submitted for analysis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImagePayload {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl ImagePayload {
    pub fn jpeg(bytes: Vec<u8>) -> Self {
        Self {
            mime_type: "image/jpeg".to_string(),
            bytes,
        }
    }

    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime_type,
            base64::engine::general_purpose::STANDARD.encode(&self.bytes)
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("analysis service unreachable: {0}")]
    Transport(String),
    #[error("analysis service returned HTTP {code}: {body}")]
    Status { code: u16, body: String },
    #[error("analysis response malformed: {0}")]
    Malformed(String),
    #[error("no analysis service configured")]
    NotConfigured,
    #[error("could not prepare still frame: {0}")]
    InvalidImage(String),
}

#[async_trait]
pub trait AnalysisOracle: Send + Sync {
    async fn analyze(&self, image: ImagePayload) -> Result<AnalysisVerdict, OracleError>;
}

/// Oracle used when no endpoint is configured; every call fails.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnavailableOracle;

#[async_trait]
impl AnalysisOracle for UnavailableOracle {
    async fn analyze(&self, _image: ImagePayload) -> Result<AnalysisVerdict, OracleError> {
        Err(OracleError::NotConfigured)
    }
}
