mod code_node;
mod db_node;
mod input_node;
mod knowledge_node;
mod llm_node;
mod lua_sandbox;
mod plugin_node;
mod question_node;

use std::sync::Arc;

use crate::nodes::CapabilityRegistry;

pub use code_node::CodeProvider;
pub use db_node::DatabaseProvider;
pub use input_node::InputProvider;
pub use knowledge_node::{KnowledgeProvider, KnowledgeRetriever, RetrievalRequest, RetrievedChunk};
pub use llm_node::LlmProvider;
pub use plugin_node::PluginProvider;
pub use question_node::QuestionProvider;

/// Register all built-in providers into the registry.
pub fn register_all(registry: &mut CapabilityRegistry) {
    registry.register(Arc::new(CodeProvider));
    registry.register(Arc::new(LlmProvider));
    registry.register(Arc::new(PluginProvider));
    registry.register(Arc::new(DatabaseProvider));
    registry.register(Arc::new(InputProvider));
    registry.register(Arc::new(QuestionProvider));
}
