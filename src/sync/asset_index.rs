//! Lookup tables over the directory assets of one node.

use std::collections::HashMap;

use tracing::debug;

use crate::directory::DirectoryClient;
use crate::domain::asset::DirectoryAsset;
use crate::error::DirectoryError;

/// Assets of a single node plus lookup maps into `assets`. Each key maps to
/// every asset carrying it, in listing order.
#[derive(Debug, Clone, Default)]
pub struct AssetIndex {
    pub assets: Vec<DirectoryAsset>,
    pub by_instance_id: HashMap<String, Vec<usize>>,
    pub by_ip: HashMap<String, Vec<usize>>,
    pub by_hostname: HashMap<String, Vec<usize>>,
}

impl AssetIndex {
    /// Index `assets`, keeping only those owned by `node_id`.
    pub fn from_assets(node_id: &str, assets: Vec<DirectoryAsset>) -> Self {
        let mut index = Self::default();
        for asset in assets.into_iter().filter(|a| a.node_id == node_id) {
            let pos = index.assets.len();
            if let Some(id) = extract_instance_id(&asset.comment) {
                index.by_instance_id.entry(id).or_default().push(pos);
            }
            let ip = asset.address.trim();
            if !ip.is_empty() {
                index.by_ip.entry(ip.to_string()).or_default().push(pos);
            }
            let host = asset.name.trim().to_lowercase();
            if !host.is_empty() {
                index.by_hostname.entry(host).or_default().push(pos);
            }
            index.assets.push(asset);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }
}

/// Fetch and index the assets under `node_id`.
pub async fn build_index(
    client: &dyn DirectoryClient,
    node_id: &str,
) -> Result<AssetIndex, DirectoryError> {
    let listed = client.list_assets(node_id).await?;
    let fetched = listed.len();
    let index = AssetIndex::from_assets(node_id, listed);
    debug!(node_id, fetched, indexed = index.len(), "built asset index");
    Ok(index)
}

const LABELS: [&str; 3] = ["instance_id", "instance id", "实例id"];

/// Read the cloud instance id back out of an asset comment.
///
/// Accepts `instance_id`, `instance id` or `实例id` (any case) followed by a
/// `:` or `：` colon; the id is the rest of the line, trimmed.
pub fn extract_instance_id(comment: &str) -> Option<String> {
    for line in comment.lines() {
        let line = line.trim();
        let Some((label, rest)) = split_label(line) else {
            continue;
        };
        if LABELS.iter().any(|l| label.trim().eq_ignore_ascii_case(l)) {
            let id = rest.trim();
            return (!id.is_empty()).then(|| id.to_string());
        }
    }
    None
}

fn split_label(line: &str) -> Option<(&str, &str)> {
    let pos = line.find([':', '：'])?;
    let colon_len = line[pos..].chars().next().map(char::len_utf8)?;
    Some((&line[..pos], &line[pos + colon_len..]))
}
