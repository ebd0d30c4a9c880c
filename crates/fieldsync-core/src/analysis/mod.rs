//! External analysis boundary
//!
//! The analysis model is a black box reached through [`AnalysisService`].
//! Dispatch builds the request with [`build_payload`] and stores whatever
//! object the service returns on the case.

mod http;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::models::timestamp::format_timestamp;
use crate::models::Case;

pub use http::HttpAnalysisClient;

/// Status value a service uses to report that it could not analyze a case.
const FAILED_STATUS: &str = "failed";

/// Why an analysis call did not produce a usable result
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Analysis request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Analysis service returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Analysis transport error: {0}")]
    Transport(String),
    #[error("Invalid analysis response: {0}")]
    InvalidResponse(String),
    #[error("Analysis service reported failure: {0}")]
    Rejected(String),
}

/// A successful analysis response, kept whole
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResponse(Map<String, Value>);

impl AnalysisResponse {
    /// Validate a response body: a JSON object carrying `analysis` and not
    /// reporting `status: "failed"`.
    pub fn from_json(body: Value) -> Result<Self, AnalysisError> {
        let Value::Object(map) = body else {
            return Err(AnalysisError::InvalidResponse(
                "response is not a JSON object".to_string(),
            ));
        };
        if map
            .get("status")
            .and_then(Value::as_str)
            .is_some_and(|status| status.eq_ignore_ascii_case(FAILED_STATUS))
        {
            let reason = map
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("no reason given");
            return Err(AnalysisError::Rejected(reason.to_string()));
        }
        if !map.contains_key("analysis") {
            return Err(AnalysisError::InvalidResponse(
                "response has no `analysis` field".to_string(),
            ));
        }
        Ok(Self(map))
    }

    /// Status reported by the service, when it sent one.
    pub fn status(&self) -> Option<&str> {
        self.0.get("status").and_then(Value::as_str)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// Remote analysis of one case payload
#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn analyze(&self, payload: &Value) -> Result<AnalysisResponse, AnalysisError>;
}

/// Build the request payload for a case.
///
/// Never fails: if a stored structured field cannot be read back, a minimal
/// payload carrying the case id and an error marker is returned instead.
pub fn build_payload(case: &Case, demographics: Option<&str>) -> Value {
    match try_build_payload(case, demographics) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(case_id = %case.id, error = %err, "Failed to build analysis payload");
            json!({
                "case_id": case.id,
                "error": "Failed to create payload",
                "risk_level": case.risk_level,
            })
        }
    }
}

fn try_build_payload(case: &Case, demographics: Option<&str>) -> serde_json::Result<Value> {
    let triage_data = parse_or(&case.triage_data, json!({}))?;
    let image_urls = match case.image_urls.as_deref() {
        Some(text) => parse_or(text, json!([]))?,
        None => json!([]),
    };

    let mut payload = json!({
        "case_id": case.id,
        "patient_id": case.patient_id,
        "chw_id": case.chw_id,
        "risk_level": case.risk_level,
        "triage_data": triage_data,
        "image_urls": image_urls,
        "timestamp": format_timestamp(&case.last_modified_at),
    });

    if let (Some(text), Value::Object(map)) = (demographics.filter(|text| !text.trim().is_empty()), &mut payload) {
        let value = serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()));
        map.insert("patient_demographics".to_string(), value);
    }
    Ok(payload)
}

/// Parse stored JSON text; blank text yields `empty`.
fn parse_or(text: &str, empty: Value) -> serde_json::Result<Value> {
    if text.trim().is_empty() {
        Ok(empty)
    } else {
        serde_json::from_str(text)
    }
}
