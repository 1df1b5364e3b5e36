pub mod node;
pub mod reference;

pub use node::{DbNode, EntityNode, NodeType, Role};
pub use reference::{ChildrenReference, ParentReference};
