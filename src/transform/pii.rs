//! PII detection and redaction via an external service

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::TransformError;
use crate::config::PiiConfig;

/// Replaces personal data in text
#[async_trait]
pub trait PiiDetector: Send + Sync {
    /// Anonymized copy of `text`
    async fn anonymize(&self, text: &str) -> Result<String, TransformError>;
}

#[derive(Serialize)]
struct AnonymizeRequest<'a> {
    text: &'a str,
    language: &'a str,
}

#[derive(Deserialize)]
struct AnonymizeResponse {
    text: String,
}

/// Redaction service over HTTP: `POST {text, language}` answers `{text}`
pub struct HttpPiiDetector {
    http: reqwest::Client,
    endpoint: String,
    language: String,
}

impl HttpPiiDetector {
    /// Detector from config, `None` when disabled
    pub fn from_config(config: &PiiConfig) -> Result<Option<Self>, TransformError> {
        if !config.enabled {
            return Ok(None);
        }
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| TransformError::Pii("no endpoint configured".to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TransformError::Pii(e.to_string()))?;
        Ok(Some(Self {
            http,
            endpoint,
            language: config.language.clone(),
        }))
    }
}

#[async_trait]
impl PiiDetector for HttpPiiDetector {
    async fn anonymize(&self, text: &str) -> Result<String, TransformError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&AnonymizeRequest {
                text,
                language: &self.language,
            })
            .send()
            .await
            .map_err(|e| TransformError::Pii(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransformError::Pii(format!(
                "service returned HTTP {}",
                response.status()
            )));
        }

        response
            .json::<AnonymizeResponse>()
            .await
            .map(|r| r.text)
            .map_err(|e| TransformError::Pii(e.to_string()))
    }
}
