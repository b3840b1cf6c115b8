//! Response transform pipeline: PII masking, then compact re-encoding.
//!
//! Only successful `tools/call` results go through the full pipeline. For
//! JSON-RPC errors only `error.data` is masked; `code` and `message` are
//! never touched. Every stage falls back to its input on failure.

mod encoding;
mod pii;

pub use encoding::{encode, estimate_tokens};
pub use pii::{HttpPiiDetector, PiiDetector};

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::TransformConfig;

/// Why a stage could not produce output
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// Redaction service failed
    #[error("PII masking failed: {0}")]
    Pii(String),
    /// Content could not be re-encoded
    #[error("Encoding failed: {0}")]
    Encoding(String),
}

/// Output of the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutcome {
    /// Result to return to the client
    pub value: Value,
    /// Whether the compact encoding replaced the original content
    pub was_converted: bool,
}

/// Configured stages
pub struct TransformPipeline {
    pii: Option<Arc<dyn PiiDetector>>,
    encode: bool,
}

impl TransformPipeline {
    /// Pipeline from config
    pub fn from_config(config: &TransformConfig) -> Result<Self, TransformError> {
        let pii = HttpPiiDetector::from_config(&config.pii)?
            .map(|d| Arc::new(d) as Arc<dyn PiiDetector>);
        Ok(Self::new(pii, config.encoding.enabled))
    }

    /// Pipeline with explicit stages
    #[must_use]
    pub fn new(pii: Option<Arc<dyn PiiDetector>>, encode: bool) -> Self {
        Self { pii, encode }
    }

    /// Transform a successful `tools/call` result
    pub async fn apply(&self, result: Value) -> TransformOutcome {
        let masked = match &self.pii {
            Some(detector) => mask_content(detector.as_ref(), result).await,
            None => result,
        };

        if !self.encode {
            return TransformOutcome {
                value: masked,
                was_converted: false,
            };
        }

        match reencode(&masked) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(error = %e, "Re-encoding skipped");
                TransformOutcome {
                    value: masked,
                    was_converted: false,
                }
            }
        }
    }

    /// Mask string leaves of a JSON-RPC `error.data`
    pub async fn apply_error_data(&self, data: Value) -> Value {
        match &self.pii {
            Some(detector) => mask_strings(detector.as_ref(), data).await,
            None => data,
        }
    }
}

/// Anonymize every `content[].text`; failures keep the original text
async fn mask_content(detector: &dyn PiiDetector, mut result: Value) -> Value {
    let Some(items) = result.get_mut("content").and_then(Value::as_array_mut) else {
        return result;
    };
    for item in items {
        if let Some(Value::String(text)) = item.get_mut("text") {
            match detector.anonymize(text).await {
                Ok(masked) => *text = masked,
                Err(e) => warn!(error = %e, "PII masking failed, returning original text"),
            }
        }
    }
    result
}

fn mask_strings(detector: &dyn PiiDetector, value: Value) -> BoxFuture<'_, Value> {
    async move {
        match value {
            Value::String(text) => match detector.anonymize(&text).await {
                Ok(masked) => Value::String(masked),
                Err(e) => {
                    warn!(error = %e, "PII masking failed, returning original text");
                    Value::String(text)
                }
            },
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(mask_strings(detector, item).await);
                }
                Value::Array(out)
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k, mask_strings(detector, v).await);
                }
                Value::Object(out)
            }
            other => other,
        }
    }
    .boxed()
}

/// Re-encode JSON text content; keep it only when projected tokens drop
pub fn reencode(result: &Value) -> Result<TransformOutcome, TransformError> {
    let items = result
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| TransformError::Encoding("result has no content array".to_string()))?;

    let mut candidate = result.clone();
    let mut changed = false;
    if let Some(out_items) = candidate.get_mut("content").and_then(Value::as_array_mut) {
        for (item, out) in items.iter().zip(out_items.iter_mut()) {
            let Some(text) = item.get("text").and_then(Value::as_str) else {
                continue;
            };
            let Ok(parsed) = serde_json::from_str::<Value>(text) else {
                continue;
            };
            if !matches!(parsed, Value::Object(_) | Value::Array(_)) {
                continue;
            }
            out["text"] = Value::String(encode(&parsed)?);
            changed = true;
        }
    }

    let before = estimate_tokens(&result.to_string());
    let after = estimate_tokens(&candidate.to_string());
    if changed && after < before {
        debug!(before, after, "Re-encoded tool result");
        Ok(TransformOutcome {
            value: candidate,
            was_converted: true,
        })
    } else {
        Ok(TransformOutcome {
            value: result.clone(),
            was_converted: false,
        })
    }
}
