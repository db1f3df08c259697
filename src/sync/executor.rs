//! Apply a reconciliation plan with bounded concurrency.
//!
//! Deletes run first, one at a time, so stale names and addresses are freed
//! before anything is created. Updates and then creates follow; a stream
//! larger than `batch_size` is split into batches that run on at most
//! `concurrency` workers. Each item fails on its own; only an authentication
//! error stops further submission for the account.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Local;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::directory::DirectoryClient;
use crate::domain::asset::{AssetDefaults, AssetPayload};
use crate::domain::instance::NormalizedInstance;
use crate::domain::plan::{PlannedUpdate, ReconciliationPlan};
use crate::domain::result::{AssetChange, ExecutionReport, FailureKind, SyncResult};
use crate::error::DirectoryError;

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub concurrency: usize,
    pub batch_size: usize,
    pub protected_ips: HashSet<String>,
    pub defaults: AssetDefaults,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            batch_size: 50,
            protected_ips: HashSet::new(),
            defaults: AssetDefaults::default(),
        }
    }
}

enum WorkItem {
    Update(PlannedUpdate),
    Create(NormalizedInstance),
}

enum Outcome {
    Created(AssetChange),
    Updated,
    Failed {
        operation: &'static str,
        subject: String,
        error: DirectoryError,
    },
    Invalid {
        operation: &'static str,
        subject: String,
        message: String,
    },
}

/// Shared by every worker of one account; locked once per finished item.
#[derive(Default)]
struct Tally {
    result: SyncResult,
    created_assets: Vec<AssetChange>,
    deleted_assets: Vec<AssetChange>,
    aborted: bool,
}

impl Tally {
    /// Record `outcome`; returns false once the account must stop.
    fn record(&mut self, outcome: Outcome) -> bool {
        match outcome {
            Outcome::Created(change) => {
                self.result.created += 1;
                self.created_assets.push(change);
            }
            Outcome::Updated => self.result.updated += 1,
            Outcome::Failed {
                operation,
                subject,
                error,
            } => {
                warn!(operation, subject = %subject, error = %error, "asset operation failed");
                self.result
                    .record_failure(operation, subject, error.to_string(), error.failure_kind());
                if error.is_auth() && !self.aborted {
                    self.aborted = true;
                    self.result.success = false;
                    self.result.error_message =
                        Some(format!("directory rejected credentials during {operation}: {error}"));
                }
            }
            Outcome::Invalid {
                operation,
                subject,
                message,
            } => {
                warn!(operation, subject = %subject, message = %message, "asset operation skipped");
                self.result
                    .record_failure(operation, subject, message, FailureKind::NonRetryable);
            }
        }
        !self.aborted
    }
}

#[derive(Clone)]
struct Worker {
    client: Arc<dyn DirectoryClient>,
    node_id: Arc<str>,
    defaults: Arc<AssetDefaults>,
    tally: Arc<Mutex<Tally>>,
}

impl Worker {
    async fn step(&self, item: WorkItem) -> bool {
        let outcome = match item {
            WorkItem::Update(update) => self.update(update).await,
            WorkItem::Create(instance) => self.create(instance).await,
        };
        self.tally.lock().await.record(outcome)
    }

    async fn create(&self, instance: NormalizedInstance) -> Outcome {
        let Some(payload) = AssetPayload::for_instance(&instance, &self.node_id, &self.defaults, Local::now())
        else {
            return Outcome::Invalid {
                operation: "create",
                subject: instance.subject(),
                message: "instance has no address".to_string(),
            };
        };
        match self.client.create_asset(&payload).await {
            Ok(asset) => {
                info!(asset_id = %asset.id, name = %asset.name, address = %asset.address, "created asset");
                Outcome::Created(AssetChange {
                    name: asset.name,
                    address: asset.address,
                    platform: asset.platform,
                    reason: None,
                })
            }
            Err(error) => Outcome::Failed {
                operation: "create",
                subject: instance.subject(),
                error,
            },
        }
    }

    async fn update(&self, update: PlannedUpdate) -> Outcome {
        let PlannedUpdate {
            asset,
            instance,
            reasons,
        } = update;
        let node_id = if asset.node_id.is_empty() {
            &*self.node_id
        } else {
            asset.node_id.as_str()
        };
        let Some(payload) = AssetPayload::for_instance(&instance, node_id, &self.defaults, Local::now())
        else {
            return Outcome::Invalid {
                operation: "update",
                subject: asset.subject(),
                message: "instance has no address".to_string(),
            };
        };
        match self.client.update_asset(&asset.id, &payload).await {
            Ok(_) => {
                info!(asset_id = %asset.id, changes = %reasons.join("; "), "updated asset");
                Outcome::Updated
            }
            Err(error) => Outcome::Failed {
                operation: "update",
                subject: asset.subject(),
                error,
            },
        }
    }

    /// Run a stream of work: inline when it fits in one batch, otherwise as
    /// batches on a semaphore-bounded pool.
    async fn run_stream(&self, items: Vec<WorkItem>, batch_size: usize, concurrency: usize) {
        if items.is_empty() || self.tally.lock().await.aborted {
            return;
        }
        let batch_size = batch_size.max(1);
        if items.len() <= batch_size {
            for item in items {
                if !self.step(item).await {
                    break;
                }
            }
            return;
        }

        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut workers = JoinSet::new();
        let mut items = items.into_iter().peekable();
        while items.peek().is_some() {
            let batch: Vec<WorkItem> = items.by_ref().take(batch_size).collect();
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            if self.tally.lock().await.aborted {
                break;
            }
            let worker = self.clone();
            workers.spawn(async move {
                let _permit = permit;
                for item in batch {
                    if !worker.step(item).await {
                        break;
                    }
                }
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "batch worker panicked");
                let mut tally = self.tally.lock().await;
                tally.result.success = false;
                tally.result.error_message = Some(format!("batch worker failed: {err}"));
            }
        }
    }
}

/// Apply `plan` to the directory under `node_id`.
pub async fn apply(
    plan: &ReconciliationPlan,
    client: Arc<dyn DirectoryClient>,
    node_id: &str,
    options: &ExecutorOptions,
) -> ExecutionReport {
    let tally = Arc::new(Mutex::new(Tally {
        result: SyncResult {
            success: true,
            skipped: plan.skipped,
            protected: plan.protected,
            ..Default::default()
        },
        ..Default::default()
    }));
    let worker = Worker {
        client: client.clone(),
        node_id: Arc::from(node_id),
        defaults: Arc::new(options.defaults.clone()),
        tally: tally.clone(),
    };

    for planned in &plan.to_delete {
        let asset = &planned.asset;
        if options.protected_ips.contains(asset.address.trim()) {
            warn!(asset = %asset.subject(), "refusing to delete protected asset");
            tally.lock().await.result.protected += 1;
            continue;
        }
        let outcome = match client.delete_asset(&asset.id).await {
            Ok(()) => {
                info!(asset_id = %asset.id, asset = %asset.subject(), reason = %planned.reason, "deleted asset");
                let mut t = tally.lock().await;
                t.result.deleted += 1;
                t.deleted_assets.push(AssetChange {
                    name: asset.name.clone(),
                    address: asset.address.clone(),
                    platform: asset.platform,
                    reason: Some(planned.reason.clone()),
                });
                continue;
            }
            Err(error) => Outcome::Failed {
                operation: "delete",
                subject: asset.subject(),
                error,
            },
        };
        if !tally.lock().await.record(outcome) {
            break;
        }
    }

    let updates = plan.to_update.iter().cloned().map(WorkItem::Update).collect();
    worker
        .run_stream(updates, options.batch_size, options.concurrency)
        .await;
    let creates = plan.to_create.iter().cloned().map(WorkItem::Create).collect();
    worker
        .run_stream(creates, options.batch_size, options.concurrency)
        .await;
    drop(worker);

    let mut guard = tally.lock().await;
    let finished = std::mem::take(&mut *guard);
    ExecutionReport {
        result: finished.result,
        created_assets: finished.created_assets,
        deleted_assets: finished.deleted_assets,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::fake::{Calls, FakeDirectory};
    use crate::domain::asset::test_asset;
    use crate::domain::instance::{test_instance, OsFamily};
    use crate::domain::plan::PlannedDelete;
    use std::time::Duration;

    fn creates(n: usize) -> Vec<NormalizedInstance> {
        (1..=n)
            .map(|i| test_instance(&format!("i-{i}"), &format!("10.0.1.{i}"), &format!("web-{i}"), OsFamily::Linux))
            .collect()
    }

    fn options(batch_size: usize, concurrency: usize) -> ExecutorOptions {
        ExecutorOptions {
            batch_size,
            concurrency,
            defaults: AssetDefaults {
                linux_platform_id: 1,
                windows_platform_id: 5,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn applies_every_stream() {
        let fake = Arc::new(FakeDirectory::default());
        fake.add_asset(test_asset("a1", "10.0.0.1", "old-name", OsFamily::Linux, "instance_id: i-1"));
        fake.add_asset(test_asset("a9", "10.0.0.9", "gone", OsFamily::Linux, "instance_id: i-9"));

        let plan = ReconciliationPlan {
            to_create: vec![test_instance("i-new", "10.0.0.5", "fresh", OsFamily::Linux)],
            to_update: vec![PlannedUpdate {
                asset: test_asset("a1", "10.0.0.1", "old-name", OsFamily::Linux, ""),
                instance: test_instance("i-1", "10.0.0.1", "new-name", OsFamily::Linux),
                reasons: vec!["name".into()],
            }],
            to_delete: vec![PlannedDelete {
                asset: test_asset("a9", "10.0.0.9", "gone", OsFamily::Linux, ""),
                reason: "instance i-9 no longer exists in the cloud".into(),
            }],
            skipped: 2,
            ..Default::default()
        };

        let report = apply(&plan, fake.clone(), "node-prod", &options(50, 5)).await;
        let r = &report.result;
        assert!(r.success);
        assert_eq!((r.created, r.updated, r.deleted, r.failed, r.skipped), (1, 1, 1, 0, 2));
        assert_eq!(report.created_assets[0].name, "fresh");
        assert_eq!(report.deleted_assets[0].reason.as_deref(), Some("instance i-9 no longer exists in the cloud"));
        assert_eq!(fake.asset_names(), vec!["fresh".to_string(), "new-name".to_string()]);

        let created = fake.assets.lock().unwrap().iter().find(|a| a.name == "fresh").cloned().unwrap();
        assert_eq!(created.node_id, "node-prod");
        assert!(created.comment.contains("instance_id: i-new"));
    }

    #[tokio::test]
    async fn large_stream_runs_in_batches() {
        let fake = Arc::new(FakeDirectory::default());
        let plan = ReconciliationPlan {
            to_create: creates(23),
            ..Default::default()
        };
        let report = apply(&plan, fake.clone(), "node-prod", &options(4, 3)).await;
        assert_eq!(report.result.created, 23);
        assert_eq!(report.created_assets.len(), 23);
        assert_eq!(Calls::get(&fake.calls.create_asset), 23);
        assert_eq!(fake.assets.lock().unwrap().len(), 23);
    }

    #[tokio::test]
    async fn batches_never_exceed_concurrency() {
        let fake = Arc::new(FakeDirectory::with_latency(Duration::from_millis(5)));
        let plan = ReconciliationPlan {
            to_create: creates(23),
            ..Default::default()
        };
        let report = apply(&plan, fake.clone(), "node-prod", &options(4, 3)).await;
        assert_eq!(report.result.created, 23);

        let peak = Calls::get(&fake.peak_in_flight);
        assert!(peak <= 3, "peak {peak} exceeds 3 workers");
        assert!(peak > 1, "batches ran one at a time");
        assert_eq!(Calls::get(&fake.in_flight), 0);
    }

    #[tokio::test]
    async fn single_batch_runs_inline() {
        let fake = Arc::new(FakeDirectory::with_latency(Duration::from_millis(1)));
        let plan = ReconciliationPlan {
            to_create: creates(4),
            ..Default::default()
        };
        apply(&plan, fake.clone(), "node-prod", &options(4, 3)).await;
        assert_eq!(Calls::get(&fake.peak_in_flight), 1);
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_siblings() {
        let fake = Arc::new(FakeDirectory::default());
        fake.failures
            .lock()
            .unwrap()
            .create_asset
            .insert("web-2".into(), DirectoryError::from_status(400, "name exists"));
        let plan = ReconciliationPlan {
            to_create: creates(5),
            ..Default::default()
        };

        let report = apply(&plan, fake.clone(), "node-prod", &options(2, 2)).await;
        let r = &report.result;
        assert!(r.success);
        assert_eq!((r.created, r.failed), (4, 1));
        assert_eq!(r.errors[0].operation, "create");
        assert_eq!(r.errors[0].kind, FailureKind::NonRetryable);
        assert!(r.errors[0].subject.contains("web-2"));
    }

    #[tokio::test]
    async fn auth_failure_stops_submission() {
        let fake = Arc::new(FakeDirectory::default());
        fake.failures.lock().unwrap().auth = true;
        let plan = ReconciliationPlan {
            to_create: creates(3),
            ..Default::default()
        };

        let report = apply(&plan, fake.clone(), "node-prod", &options(50, 5)).await;
        assert!(!report.result.success);
        assert_eq!(report.result.failed, 1);
        assert!(report.result.error_message.unwrap().contains("credentials"));
        assert_eq!(Calls::get(&fake.calls.create_asset), 1);
    }

    #[tokio::test]
    async fn protected_asset_is_refused_at_execution() {
        let fake = Arc::new(FakeDirectory::default());
        fake.add_asset(test_asset("a8", "10.0.0.8", "bastion", OsFamily::Linux, ""));
        let plan = ReconciliationPlan {
            to_delete: vec![PlannedDelete {
                asset: test_asset("a8", "10.0.0.8", "bastion", OsFamily::Linux, ""),
                reason: "no matching cloud instance".into(),
            }],
            ..Default::default()
        };
        let opts = ExecutorOptions {
            protected_ips: HashSet::from(["10.0.0.8".to_string()]),
            ..options(50, 5)
        };

        let report = apply(&plan, fake.clone(), "node-prod", &opts).await;
        assert_eq!(report.result.deleted, 0);
        assert_eq!(report.result.protected, 1);
        assert_eq!(Calls::get(&fake.calls.delete_asset), 0);
        assert_eq!(fake.asset_names(), vec!["bastion".to_string()]);
    }

    #[tokio::test]
    async fn transient_failure_is_recorded_as_terminal() {
        let fake = Arc::new(FakeDirectory::default());
        fake.add_asset(test_asset("a9", "10.0.0.9", "gone", OsFamily::Linux, ""));
        fake.failures
            .lock()
            .unwrap()
            .delete_asset
            .insert("a9".into(), DirectoryError::from_status(503, "unavailable"));
        let plan = ReconciliationPlan {
            to_delete: vec![PlannedDelete {
                asset: test_asset("a9", "10.0.0.9", "gone", OsFamily::Linux, ""),
                reason: "gone".into(),
            }],
            ..Default::default()
        };

        let report = apply(&plan, fake.clone(), "node-prod", &options(50, 5)).await;
        assert!(report.result.success);
        assert_eq!(report.result.failed, 1);
        assert_eq!(report.result.errors[0].kind, FailureKind::Terminal);
        assert!(report.deleted_assets.is_empty());
    }
}
