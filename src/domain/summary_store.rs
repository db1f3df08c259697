//! SummaryStore: the `--output` JSON file of a run.
//!
//! The file is the run summary itself, `{success, results, duration}`, with
//! results keyed `<provider>-<account>`. It is written to a `.tmp` sibling
//! and renamed into place, so a reader never sees a partial file.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::debug;

use super::result::RunSummary;

pub struct SummaryStore {
    path: PathBuf,
}

impl SummaryStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub async fn write(&self, summary: &RunSummary) -> Result<()> {
        let content =
            serde_json::to_string_pretty(summary).context("failed to serialize RunSummary")?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &content)
            .await
            .with_context(|| format!("writing temp file {}", tmp_path.display()))?;

        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| {
                format!(
                    "renaming {} to {}",
                    tmp_path.display(),
                    self.path.display()
                )
            })?;

        debug!(path = %self.path.display(), accounts = summary.results.len(), "summary written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::result::SyncResult;

    fn sample() -> RunSummary {
        let mut summary = RunSummary {
            success: true,
            duration_secs: 1.5,
            ..Default::default()
        };
        summary.results.insert(
            "aliyun-prod".into(),
            SyncResult { created: 3, total: 3, success: true, duration_secs: 0.7, ..Default::default() },
        );
        summary
    }

    #[tokio::test]
    async fn writes_results_and_duration_at_top_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/summary.json");
        SummaryStore::new(path.clone()).write(&sample()).await.unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["duration"], 1.5);
        assert_eq!(value["results"]["aliyun-prod"]["created"], 3);
        assert_eq!(value["results"]["aliyun-prod"]["duration"], 0.7);
        assert!(value.get("summary").is_none());
        assert!(!dir.path().join("out/summary.json.tmp").exists());

        let parsed: RunSummary = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, sample());
    }

    #[tokio::test]
    async fn rewrite_replaces_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        let store = SummaryStore::new(path.clone());
        store.write(&RunSummary::default()).await.unwrap();
        store.write(&sample()).await.unwrap();

        let parsed: RunSummary =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.results.len(), 1);
    }
}
