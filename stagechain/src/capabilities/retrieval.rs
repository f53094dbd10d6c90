//! Retrieval and embedding collaborators.

use crate::errors::CapabilityError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A retrieved document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document text.
    pub page_content: String,
    /// Source metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Document {
    /// Creates a document without metadata.
    #[must_use]
    pub fn new(page_content: impl Into<String>) -> Self {
        Self {
            page_content: page_content.into(),
            metadata: HashMap::new(),
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Similarity search over a document store.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Returns the retriever name used in errors and logs.
    fn name(&self) -> &str;

    /// Returns the documents most relevant to `query`.
    async fn retrieve(&self, query: &str) -> Result<Vec<Document>, CapabilityError>;
}

/// Text embedding.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the embedder name used in errors and logs.
    fn name(&self) -> &str;

    /// Embeds each text; the result has one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError>;
}
