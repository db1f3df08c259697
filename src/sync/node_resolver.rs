//! Resolve or create the `/{root}/{provider}/{account}` node for one account.
//!
//! The cache is owned by the resolver and lives for one account sync.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::directory::DirectoryClient;
use crate::domain::asset::DirectoryNode;
use crate::domain::instance::ProviderType;
use crate::error::{DirectoryError, SyncError};

/// The node assets should be placed under. `degraded` is set when a
/// segment could not be created and an ancestor stands in for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNode {
    pub node: DirectoryNode,
    pub path: String,
    pub degraded: bool,
}

pub struct NodePathResolver {
    client: Arc<dyn DirectoryClient>,
    root: String,
    cache: HashMap<String, DirectoryNode>,
}

impl NodePathResolver {
    pub fn new(client: Arc<dyn DirectoryClient>, root: impl Into<String>) -> Self {
        Self {
            client,
            root: root.into(),
            cache: HashMap::new(),
        }
    }

    pub async fn resolve_or_create(
        &mut self,
        provider: ProviderType,
        account_name: &str,
    ) -> Result<ResolvedNode, SyncError> {
        self.walk(provider, account_name, true)
            .await?
            .ok_or_else(|| SyncError::RootNodeMissing(self.root.clone()))
    }

    /// Find the account node without creating anything; `Ok(None)` when a
    /// segment does not exist yet.
    pub async fn lookup(
        &mut self,
        provider: ProviderType,
        account_name: &str,
    ) -> Result<Option<ResolvedNode>, SyncError> {
        self.walk(provider, account_name, false).await
    }

    async fn walk(
        &mut self,
        provider: ProviderType,
        account_name: &str,
        create: bool,
    ) -> Result<Option<ResolvedNode>, SyncError> {
        let root_path = format!("/{}", self.root);
        let mut current = match self.cache.get(&root_path) {
            Some(node) => node.clone(),
            None => {
                let roots = self.client.resolve_children(None).await?;
                let root = find_child(&roots, &self.root)
                    .ok_or_else(|| SyncError::RootNodeMissing(self.root.clone()))?;
                self.cache.insert(root_path.clone(), root.clone());
                root
            }
        };
        let mut path = root_path;

        for segment in [provider.as_str(), account_name] {
            let child_path = format!("{path}/{segment}");
            if let Some(node) = self.cache.get(&child_path) {
                current = node.clone();
                path = child_path;
                continue;
            }

            let found = if create {
                self.find_or_create(&current, segment).await?
            } else {
                let children = self.client.resolve_children(Some(&current.key)).await?;
                match find_child(&children, segment) {
                    Some(node) => Some(node),
                    None => return Ok(None),
                }
            };
            match found {
                Some(node) => {
                    self.cache.insert(child_path.clone(), node.clone());
                    current = node;
                    path = child_path;
                }
                None => {
                    warn!(
                        wanted = %child_path,
                        fallback = %path,
                        "node unavailable, placing assets under ancestor"
                    );
                    return Ok(Some(ResolvedNode {
                        node: current,
                        path,
                        degraded: true,
                    }));
                }
            }
        }

        debug!(path = %path, node_id = %current.id, "resolved account node");
        Ok(Some(ResolvedNode {
            node: current,
            path,
            degraded: false,
        }))
    }

    /// `Ok(None)` means the child neither exists nor could be created.
    async fn find_or_create(
        &self,
        parent: &DirectoryNode,
        value: &str,
    ) -> Result<Option<DirectoryNode>, DirectoryError> {
        let children = self.client.resolve_children(Some(&parent.key)).await?;
        if let Some(node) = find_child(&children, value) {
            return Ok(Some(node));
        }

        match self.client.create_child_node(&parent.id, value).await {
            Ok(node) => {
                info!(parent = %parent.value, value, node_id = %node.id, "created node");
                Ok(Some(node))
            }
            Err(err) if err.is_auth() => Err(err),
            Err(err) => {
                warn!(parent = %parent.value, value, error = %err, "node creation failed, re-listing");
                let children = self.client.resolve_children(Some(&parent.key)).await?;
                Ok(find_child(&children, value))
            }
        }
    }
}

fn find_child(nodes: &[DirectoryNode], value: &str) -> Option<DirectoryNode> {
    nodes
        .iter()
        .find(|n| n.value.eq_ignore_ascii_case(value))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::fake::{Calls, FakeDirectory};

    fn resolver(fake: &Arc<FakeDirectory>) -> NodePathResolver {
        NodePathResolver::new(fake.clone(), "DEFAULT")
    }

    #[tokio::test]
    async fn creates_missing_segments_then_caches() {
        let fake = Arc::new(FakeDirectory::with_root());
        let mut r = resolver(&fake);

        let resolved = r.resolve_or_create(ProviderType::Aliyun, "prod").await.unwrap();
        assert!(!resolved.degraded);
        assert_eq!(resolved.path, "/DEFAULT/aliyun/prod");
        assert_eq!(resolved.node.value, "prod");
        assert_eq!(Calls::get(&fake.calls.create_child_node), 2);

        let before = Calls::get(&fake.calls.resolve_children);
        let again = r.resolve_or_create(ProviderType::Aliyun, "prod").await.unwrap();
        assert_eq!(again, resolved);
        assert_eq!(Calls::get(&fake.calls.resolve_children), before);
        assert_eq!(Calls::get(&fake.calls.create_child_node), 2);
    }

    #[tokio::test]
    async fn matches_existing_nodes_case_insensitively() {
        let fake = Arc::new(FakeDirectory::with_root());
        fake.add_node("1", "n-aliyun", "Aliyun");
        fake.add_node("1:1", "n-prod", "PROD");
        let mut r = resolver(&fake);

        let resolved = r.resolve_or_create(ProviderType::Aliyun, "prod").await.unwrap();
        assert_eq!(resolved.node.id, "n-prod");
        assert_eq!(Calls::get(&fake.calls.create_child_node), 0);
    }

    #[tokio::test]
    async fn lost_creation_race_uses_existing_node() {
        let fake = Arc::new(FakeDirectory::with_root());
        fake.failures.lock().unwrap().create_node_race.push("prod".into());
        let mut r = resolver(&fake);

        let resolved = r.resolve_or_create(ProviderType::Aliyun, "prod").await.unwrap();
        assert!(!resolved.degraded);
        assert_eq!(resolved.node.value, "prod");
    }

    #[tokio::test]
    async fn failed_creation_degrades_to_ancestor() {
        let fake = Arc::new(FakeDirectory::with_root());
        fake.failures
            .lock()
            .unwrap()
            .create_node
            .insert("prod".into(), DirectoryError::from_status(500, "boom"));
        let mut r = resolver(&fake);

        let resolved = r.resolve_or_create(ProviderType::Aliyun, "prod").await.unwrap();
        assert!(resolved.degraded);
        assert_eq!(resolved.path, "/DEFAULT/aliyun");
        assert_eq!(resolved.node.value, "aliyun");
    }

    #[tokio::test]
    async fn lookup_never_creates() {
        let fake = Arc::new(FakeDirectory::with_root());
        fake.add_node("1", "n-aliyun", "aliyun");
        let mut r = resolver(&fake);

        assert_eq!(r.lookup(ProviderType::Aliyun, "prod").await.unwrap(), None);
        assert_eq!(Calls::get(&fake.calls.create_child_node), 0);

        fake.add_node("1:1", "n-prod", "prod");
        let found = r.lookup(ProviderType::Aliyun, "prod").await.unwrap().unwrap();
        assert_eq!(found.node.id, "n-prod");
    }

    #[tokio::test]
    async fn missing_root_aborts() {
        let fake = Arc::new(FakeDirectory::default());
        let mut r = resolver(&fake);
        let err = r.resolve_or_create(ProviderType::Huawei, "x").await.unwrap_err();
        assert!(matches!(err, SyncError::RootNodeMissing(ref root) if root == "DEFAULT"));
    }

    #[tokio::test]
    async fn auth_failure_is_not_degraded() {
        let fake = Arc::new(FakeDirectory::with_root());
        fake.add_node("1", "n-aliyun", "aliyun");
        fake.failures
            .lock()
            .unwrap()
            .create_node
            .insert("prod".into(), DirectoryError::from_status(403, "forbidden"));
        let mut r = resolver(&fake);

        let err = r.resolve_or_create(ProviderType::Aliyun, "prod").await.unwrap_err();
        assert!(matches!(err, SyncError::Directory(ref e) if e.is_auth()));
    }
}
