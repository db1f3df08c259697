//! Sync results: per-account tallies and the run-level summary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::instance::{OsFamily, ProviderType};

/// Terminal state a failed mutation reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retryable error that exhausted the retry policy.
    Terminal,
    /// Rejected outright (validation, 4xx, auth).
    NonRetryable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub operation: String,
    pub subject: String,
    pub message: String,
    pub kind: FailureKind,
}

/// Outcome of one account sync. Built incrementally by the executor and
/// finalised once before being returned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
    pub skipped: usize,
    pub protected: usize,
    pub total: usize,
    pub expected_total: Option<usize>,
    #[serde(rename = "duration")]
    pub duration_secs: f64,
    pub success: bool,
    pub error_message: Option<String>,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
}

impl SyncResult {
    /// A result for an account that stopped before any mutation.
    pub fn aborted(total: usize, expected_total: Option<usize>, message: impl Into<String>) -> Self {
        Self {
            total,
            expected_total,
            success: false,
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn record_failure(
        &mut self,
        operation: &str,
        subject: impl Into<String>,
        message: impl Into<String>,
        kind: FailureKind,
    ) {
        self.failed += 1;
        self.errors.push(ErrorEntry {
            operation: operation.to_string(),
            subject: subject.into(),
            message: message.into(),
            kind,
        });
    }

    pub fn has_changes(&self) -> bool {
        self.created + self.updated + self.deleted > 0
    }

    /// True when the account finished cleanly: no abort, no failed item.
    pub fn is_clean(&self) -> bool {
        self.success && self.failed == 0
    }
}

/// One asset created or deleted during a sync, for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetChange {
    pub name: String,
    pub address: String,
    pub platform: OsFamily,
    pub reason: Option<String>,
}

/// What the executor hands back: the tally plus the changed assets.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub result: SyncResult,
    pub created_assets: Vec<AssetChange>,
    pub deleted_assets: Vec<AssetChange>,
}

/// Payload handed to a notifier after each account.
#[derive(Debug, Clone)]
pub struct AccountReport {
    pub sync_result: SyncResult,
    pub provider_type: ProviderType,
    pub account_name: String,
    pub created_assets: Vec<AssetChange>,
    pub deleted_assets: Vec<AssetChange>,
    pub is_failure: bool,
}

/// Result of one `sync` invocation across all enabled accounts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub success: bool,
    pub results: BTreeMap<String, SyncResult>,
    #[serde(rename = "duration")]
    pub duration_secs: f64,
}

impl RunSummary {
    pub fn account_key(provider: ProviderType, account: &str) -> String {
        format!("{provider}-{account}")
    }

    /// Exit code for the process: 0 only when every account finished cleanly.
    /// An aborted account counts as failed even with no failed asset.
    pub fn exit_code(&self) -> i32 {
        if self.success && self.results.values().all(SyncResult::is_clean) {
            0
        } else {
            2
        }
    }

    /// Every account aborted before reconciling. Drives whole-run retry.
    pub fn all_aborted(&self) -> bool {
        !self.results.is_empty() && self.results.values().all(|r| !r.success)
    }

    pub fn totals(&self) -> SyncResult {
        let mut acc = SyncResult {
            success: self.success,
            ..Default::default()
        };
        for r in self.results.values() {
            acc.created += r.created;
            acc.updated += r.updated;
            acc.deleted += r.deleted;
            acc.failed += r.failed;
            acc.skipped += r.skipped;
            acc.protected += r.protected;
            acc.total += r.total;
        }
        acc.duration_secs = self.duration_secs;
        acc
    }
}
