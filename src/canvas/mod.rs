pub mod parse;
pub mod types;
pub mod validate;

pub use parse::{parse, parse_unchecked};
pub use types::*;
pub use validate::{Issue, NodeRef, PathRef, validate_tree};
