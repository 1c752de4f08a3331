//! Typed property graph storage.
//!
//! ## Modules
//!
//! - [`model`]: Identities, property values, nodes, edges, reserved labels
//! - [`backend`]: `GraphBackend` storage contract and `GraphBackendExt` helpers
//! - [`memory`]: `InMemoryBackend` with copy-on-begin transactions and JSON snapshots

pub mod backend;
pub mod memory;
pub mod model;

// Re-export primary types for convenience
pub use backend::{BackendMode, GraphBackend, GraphBackendExt};
pub use memory::InMemoryBackend;
pub use model::{
    Direction, EdgeId, GraphEdge, GraphNode, NodeId, Properties, PropertyValue,
};
