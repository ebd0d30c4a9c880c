//! HTTP client for the analysis service.

use async_trait::async_trait;
use serde_json::Value;

use super::{AnalysisError, AnalysisResponse, AnalysisService};
use crate::config::AnalysisClientConfig;
use crate::util::compact_text;

#[derive(Clone)]
pub struct HttpAnalysisClient {
    config: AnalysisClientConfig,
    client: reqwest::Client,
}

impl HttpAnalysisClient {
    pub fn new(config: AnalysisClientConfig) -> Result<Self, AnalysisError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| AnalysisError::Transport(err.to_string()))?;
        Ok(Self { config, client })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    fn classify(&self, err: &reqwest::Error) -> AnalysisError {
        if err.is_timeout() {
            AnalysisError::Timeout(self.config.timeout)
        } else {
            AnalysisError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl AnalysisService for HttpAnalysisClient {
    async fn analyze(&self, payload: &Value) -> Result<AnalysisResponse, AnalysisError> {
        let response = self
            .client
            .post(&self.config.endpoint)
            .header("Accept", "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|err| self.classify(&err))?;

        let status = response.status();
        let body = response.text().await.map_err(|err| self.classify(&err))?;
        if !status.is_success() {
            return Err(AnalysisError::Http {
                status: status.as_u16(),
                body: compact_text(&body),
            });
        }

        let body: Value = serde_json::from_str(&body)
            .map_err(|err| AnalysisError::InvalidResponse(err.to_string()))?;
        AnalysisResponse::from_json(body)
    }
}
