//! The reconciliation engine.

pub mod asset_index;
pub mod executor;
pub mod node_resolver;
pub mod orchestrator;
pub mod reconciler;

pub use orchestrator::{AccountJob, AccountPreview, SyncOrchestrator};
