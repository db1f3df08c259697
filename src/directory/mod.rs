//! Directory client: the bastion's client-visible contract.
//!
//! Everything above this module works with `DirectoryAsset` and
//! `DirectoryNode`; wire formats stay inside the implementation.

pub mod jumpserver;
pub mod signature;

use async_trait::async_trait;

use crate::domain::asset::{AssetPayload, DirectoryAsset, DirectoryNode};
use crate::error::DirectoryError;

pub use jumpserver::JumpServerClient;

#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Children of the node with `parent_key`; `None` lists the org roots.
    async fn resolve_children(
        &self,
        parent_key: Option<&str>,
    ) -> Result<Vec<DirectoryNode>, DirectoryError>;

    async fn create_child_node(
        &self,
        parent_id: &str,
        value: &str,
    ) -> Result<DirectoryNode, DirectoryError>;

    /// Every asset attached to `node_id`, all pages.
    async fn list_assets(&self, node_id: &str) -> Result<Vec<DirectoryAsset>, DirectoryError>;

    async fn create_asset(&self, payload: &AssetPayload) -> Result<DirectoryAsset, DirectoryError>;

    async fn update_asset(
        &self,
        id: &str,
        payload: &AssetPayload,
    ) -> Result<DirectoryAsset, DirectoryError>;

    async fn delete_asset(&self, id: &str) -> Result<(), DirectoryError>;
}
