pub mod composite;
pub mod executor;
pub mod interrupt;
pub mod policy;
pub mod resolve;
pub mod scope;
pub mod template;
pub mod types;

pub use executor::{EngineConfig, RunOptions, RunReport, WorkflowEngine};
pub use interrupt::{InterruptEvent, InterruptType, NodeAddress};
pub use types::*;
