//! Per-account pipeline: enumerate, guard, resolve, index, plan, apply,
//! notify. Accounts run one after another; a failed account never stops the
//! next one.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use super::asset_index::{build_index, AssetIndex};
use super::executor::{self, ExecutorOptions};
use super::node_resolver::NodePathResolver;
use super::reconciler::{self, ReconcileOptions};
use crate::cloud::{enumerate_account, AccountListing, CloudAccount, InstanceSource};
use crate::directory::DirectoryClient;
use crate::domain::plan::ReconciliationPlan;
use crate::domain::result::{AccountReport, ExecutionReport, RunSummary, SyncResult};
use crate::error::SyncError;
use crate::notify::Notifier;

/// Everything needed to sync one cloud account.
#[derive(Clone)]
pub struct AccountJob {
    pub account: CloudAccount,
    pub source: Arc<dyn InstanceSource>,
    pub reconcile: ReconcileOptions,
    pub executor: ExecutorOptions,
}

impl AccountJob {
    pub fn key(&self) -> String {
        RunSummary::account_key(self.account.provider, &self.account.name)
    }
}

/// Dry-run view of one account, produced without touching the directory.
#[derive(Debug, Clone)]
pub struct AccountPreview {
    pub key: String,
    pub node_path: String,
    /// False when the account node does not exist yet and would be created.
    pub node_exists: bool,
    pub enumerated: usize,
    pub plan: ReconciliationPlan,
}

pub struct SyncOrchestrator {
    client: Arc<dyn DirectoryClient>,
    notifier: Option<Arc<dyn Notifier>>,
    root_node: String,
}

impl SyncOrchestrator {
    pub fn new(client: Arc<dyn DirectoryClient>, root_node: impl Into<String>) -> Self {
        Self {
            client,
            notifier: None,
            root_node: root_node.into(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Sync one account. Never fails: aborts are reported in the result.
    pub async fn sync_account(&self, job: &AccountJob) -> AccountReport {
        let started = Instant::now();
        let account = &job.account;
        info!(provider = %account.provider, account = %account.name, regions = ?account.regions, "syncing account");

        let listing = enumerate_account(job.source.as_ref(), account).await;
        let total = listing.instances.len();
        let expected = (listing.reported_total > 0).then_some(listing.reported_total);

        let mut report = match self.reconcile(job, &listing).await {
            Ok(execution) => execution,
            Err(err) => {
                error!(provider = %account.provider, account = %account.name, error = %err, "account sync aborted");
                ExecutionReport {
                    result: SyncResult::aborted(total, expected, err.to_string()),
                    ..Default::default()
                }
            }
        };
        report.result.total = total;
        report.result.expected_total = expected;
        report.result.duration_secs = started.elapsed().as_secs_f64();

        let r = &report.result;
        info!(
            provider = %account.provider,
            account = %account.name,
            total = r.total,
            created = r.created,
            updated = r.updated,
            deleted = r.deleted,
            skipped = r.skipped,
            protected = r.protected,
            failed = r.failed,
            duration_secs = r.duration_secs,
            success = r.success,
            "account sync finished"
        );

        let account_report = AccountReport {
            is_failure: !report.result.is_clean(),
            sync_result: report.result,
            provider_type: account.provider,
            account_name: account.name.clone(),
            created_assets: report.created_assets,
            deleted_assets: report.deleted_assets,
        };
        self.notify(&account_report).await;
        account_report
    }

    async fn reconcile(&self, job: &AccountJob, listing: &AccountListing) -> Result<ExecutionReport, SyncError> {
        let mut options = job.reconcile.clone();
        if !check_listing(&job.account, listing)? {
            return Ok(ExecutionReport {
                result: SyncResult {
                    success: true,
                    error_message: Some("no instances enumerated, reconciliation skipped".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            });
        }
        if !listing.failed_regions.is_empty() {
            warn!(
                account = %job.account.name,
                failed_regions = ?listing.failed_regions,
                "partial enumeration, deletes disabled for this account"
            );
            options.no_delete = true;
        }

        let mut resolver = NodePathResolver::new(self.client.clone(), self.root_node.clone());
        let resolved = resolver
            .resolve_or_create(job.account.provider, &job.account.name)
            .await?;
        if resolved.degraded {
            warn!(path = %resolved.path, "degraded node placement, deletes disabled for this account");
            options.no_delete = true;
        }

        let index = build_index(self.client.as_ref(), &resolved.node.id).await?;
        let plan = reconciler::plan(&listing.instances, &index, &options);
        info!(
            path = %resolved.path,
            indexed = index.len(),
            mutations = plan.mutation_count(),
            create = plan.to_create.len(),
            update = plan.to_update.len(),
            delete = plan.to_delete.len(),
            skipped = plan.skipped,
            protected = plan.protected,
            excluded = plan.excluded,
            "reconciliation planned"
        );

        Ok(executor::apply(&plan, self.client.clone(), &resolved.node.id, &job.executor).await)
    }

    /// Plan one account without mutating anything, not even missing nodes.
    pub async fn preview_account(&self, job: &AccountJob) -> Result<AccountPreview, SyncError> {
        let listing = enumerate_account(job.source.as_ref(), &job.account).await;
        let mut options = job.reconcile.clone();
        options.no_delete |= !listing.failed_regions.is_empty();
        let proceed = check_listing(&job.account, &listing)?;

        let mut resolver = NodePathResolver::new(self.client.clone(), self.root_node.clone());
        let found = resolver.lookup(job.account.provider, &job.account.name).await?;
        let (node_path, index) = match &found {
            Some(resolved) => (
                resolved.path.clone(),
                build_index(self.client.as_ref(), &resolved.node.id).await?,
            ),
            None => (
                format!("/{}/{}/{}", self.root_node, job.account.provider, job.account.name),
                AssetIndex::default(),
            ),
        };
        let plan = if proceed {
            reconciler::plan(&listing.instances, &index, &options)
        } else {
            ReconciliationPlan::default()
        };

        Ok(AccountPreview {
            key: job.key(),
            node_path,
            node_exists: found.is_some(),
            enumerated: listing.instances.len(),
            plan,
        })
    }

    async fn notify(&self, report: &AccountReport) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        if let Err(err) = notifier.notify(report).await {
            warn!(account = %report.account_name, error = %err, "notification failed");
        }
    }

    /// Sync every job in order.
    pub async fn run(&self, jobs: &[AccountJob]) -> RunSummary {
        let started = Instant::now();
        let mut results = BTreeMap::new();
        for job in jobs {
            let report = self.sync_account(job).await;
            results.insert(job.key(), report.sync_result);
        }
        RunSummary {
            success: results.values().all(|r| r.success),
            results,
            duration_secs: started.elapsed().as_secs_f64(),
        }
    }

    /// `run` repeated up to `retries` more times while every account aborts.
    pub async fn run_with_retry(&self, jobs: &[AccountJob], retries: u32, interval: Duration) -> RunSummary {
        let mut attempt = 0;
        loop {
            let summary = self.run(jobs).await;
            if !summary.all_aborted() || attempt >= retries {
                return summary;
            }
            attempt += 1;
            warn!(attempt, retries, interval_secs = interval.as_secs_f64(), "every account aborted, retrying run");
            tokio::time::sleep(interval).await;
        }
    }
}

/// Guards that must hold before planning. `Ok(false)` means nothing was
/// enumerated and the account must not be reconciled.
fn check_listing(account: &CloudAccount, listing: &AccountListing) -> Result<bool, SyncError> {
    if !account.regions.is_empty() && listing.failed_regions.len() == account.regions.len() {
        return Err(SyncError::EnumerationFailed(listing.failed_regions.clone()));
    }
    let actual = listing.instances.len();
    if listing.reported_total != 0 && listing.reported_total != actual {
        return Err(SyncError::CountMismatch {
            expected: listing.reported_total,
            actual,
        });
    }
    if actual == 0 {
        warn!(account = %account.name, "no instances enumerated, skipping reconciliation");
        return Ok(false);
    }
    Ok(true)
}
