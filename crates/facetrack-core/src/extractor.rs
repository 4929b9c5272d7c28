//! Boundary with the external embedding extractor.
//!
//! The extraction service answers each image with either
//! `{"encoding": [f32, ...]}` or `{"error": "No face detected"}`.

use crate::types::Embedding;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("extractor failed: {0}")]
    Failed(String),
    #[error("malformed extractor response: {0}")]
    Malformed(String),
}

/// One response from the extraction service.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EncodingResponse {
    #[serde(default)]
    pub encoding: Option<Vec<f32>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub model_version: Option<String>,
}

impl EncodingResponse {
    /// Parse a raw response body.
    pub fn parse(body: &str) -> Result<Self, ExtractionError> {
        serde_json::from_str(body).map_err(|e| ExtractionError::Malformed(e.to_string()))
    }

    /// An `error` field wins over any encoding sent alongside it.
    ///
    /// Length and finiteness are not checked here; the matcher and store do
    /// that against the configured dimension.
    pub fn into_embedding(self) -> Result<Embedding, ExtractionError> {
        if let Some(error) = self.error {
            return Err(ExtractionError::Failed(error));
        }
        match self.encoding {
            Some(values) if !values.is_empty() => Ok(Embedding {
                values,
                model_version: self.model_version,
            }),
            Some(_) => Err(ExtractionError::Malformed("empty encoding".into())),
            None => Err(ExtractionError::Malformed(
                "neither encoding nor error present".into(),
            )),
        }
    }
}

/// Parse a response body straight into an embedding.
pub fn parse_embedding(body: &str) -> Result<Embedding, ExtractionError> {
    EncodingResponse::parse(body)?.into_embedding()
}
