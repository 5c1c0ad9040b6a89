use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::canvas::NodeKind;
use crate::nodes::{CapabilityProvider, NodeInput, NodeOutcome, NodeOutput};

/// A retrieval request built from the node's `Query` input and config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub knowledge_ids: Vec<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub min_score: Option<f64>,
}

fn default_top_k() -> usize {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub output: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub document_id: Option<String>,
}

/// Backend that answers knowledge queries. Supplied by the embedder.
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    async fn retrieve(&self, request: &RetrievalRequest) -> Result<Vec<RetrievedChunk>>;
}

/// Adapts a [`KnowledgeRetriever`] to the knowledge retrieval node.
pub struct KnowledgeProvider {
    retriever: Arc<dyn KnowledgeRetriever>,
}

impl KnowledgeProvider {
    pub fn new(retriever: Arc<dyn KnowledgeRetriever>) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl CapabilityProvider for KnowledgeProvider {
    fn node_type(&self) -> NodeKind {
        NodeKind::KnowledgeRetrieval
    }

    fn description(&self) -> &str {
        "Retrieve chunks from knowledge bases"
    }

    async fn execute(&self, input: NodeInput) -> Result<NodeOutcome> {
        let mut request: RetrievalRequest = if input.config.is_null() {
            serde_json::from_value(Value::Object(Map::new()))?
        } else {
            serde_json::from_value(input.config.clone()).context("invalid knowledge config")?
        };
        if let Some(query) = input.inputs.get("Query").and_then(Value::as_str) {
            request.query = query.to_string();
        }

        let mut chunks = self.retriever.retrieve(&request).await?;
        if let Some(min) = request.min_score {
            chunks.retain(|c| c.score.is_none_or(|s| s >= min));
        }
        chunks.truncate(request.top_k);

        let output = Map::from_iter([("outputList".to_string(), serde_json::to_value(chunks)?)]);
        Ok(NodeOutcome::Output(NodeOutput::new(output)))
    }
}
