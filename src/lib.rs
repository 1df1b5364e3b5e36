pub mod audit;
pub mod cache;
pub mod config;
pub mod db;
pub mod depth;
pub mod engine;
pub mod errors;
pub mod models;
pub mod mutation;
pub mod oplog;
pub mod retry;
pub mod store;
pub mod traversal;
pub mod utils;

// Re-export commonly used items for tests and the binary
pub use config::EngineConfig;
pub use engine::MembershipEngine;
pub use errors::{GraphError, GraphResult};
pub use models::{ChildrenReference, EntityNode, NodeType, ParentReference, Role};
pub use mutation::AffectedUsers;
pub use store::{GraphSnapshot, GraphStore, InMemoryGraphStore};
