//! `jms-sync sync`: reconcile every enabled cloud account into JumpServer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use colored::Colorize;
use serde::Serialize;
use tracing::info;

use crate::cloud::{self, mask_key};
use crate::config::{self, Config};
use crate::directory::{DirectoryClient, JumpServerClient};
use crate::domain::result::RunSummary;
use crate::domain::summary_store::SummaryStore;
use crate::logging;
use crate::notify::DingTalkNotifier;
use crate::sync::{AccountJob, AccountPreview, SyncOrchestrator};

#[derive(Debug, Clone, Default)]
pub struct SyncArgs {
    pub config: Option<PathBuf>,
    pub retries: Option<u32>,
    pub interval: Option<u64>,
    pub output: Option<PathBuf>,
    pub log_level: Option<String>,
    pub diff: bool,
}

/// Returns the process exit code: 0 clean, 2 when anything failed.
pub fn run(args: SyncArgs) -> Result<i32> {
    let (path, cfg) = config::load(args.config.as_deref())?;
    cfg.validate()?;

    let level = args.log_level.clone().unwrap_or_else(|| cfg.log.level.clone());
    if !config::is_valid_level(&level) {
        bail!("invalid log level '{level}'");
    }
    logging::init(&level, cfg.log.format, cfg.log.file.as_deref())?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %path.display(),
        "jms-sync starting"
    );

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_async(args, cfg))
}

async fn run_async(args: SyncArgs, cfg: Config) -> Result<i32> {
    let client: Arc<dyn DirectoryClient> = Arc::new(
        JumpServerClient::new(&cfg.jumpserver_settings()?, cfg.retry_policy())
            .context("building JumpServer client")?,
    );
    let jobs = build_jobs(&cfg)?;
    if jobs.is_empty() {
        println!("{} No enabled cloud accounts, nothing to do", "!!".yellow().bold());
        return Ok(0);
    }

    let mut orchestrator = SyncOrchestrator::new(client, cfg.root_node());
    if let Some(settings) = cfg.dingtalk_settings() {
        let notifier = DingTalkNotifier::new(settings, cfg.http_timeout())?;
        orchestrator = orchestrator.with_notifier(Arc::new(notifier));
    }

    if args.diff {
        println!("{} Diff mode, nothing will be changed", ">>".blue().bold());
        for job in &jobs {
            match orchestrator.preview_account(job).await {
                Ok(preview) => print_preview(&preview)?,
                Err(e) => println!("{} {}: {}", "!!".red().bold(), job.key(), e),
            }
        }
        return Ok(0);
    }

    let retries = args.retries.unwrap_or(cfg.sync.run_retries);
    let interval = Duration::from_secs(args.interval.unwrap_or(cfg.sync.run_retry_interval_secs));
    println!(
        "{} Syncing {} account(s) into {}",
        ">>".blue().bold(),
        jobs.len(),
        cfg.root_node()
    );
    let summary = orchestrator.run_with_retry(&jobs, retries, interval).await;
    print_summary(&summary);

    if let Some(output) = args.output {
        SummaryStore::new(output.clone())
            .write(&summary)
            .await
            .with_context(|| format!("writing summary to {}", output.display()))?;
        println!("{} Summary written to {}", "ok".green().bold(), output.display());
    }

    Ok(summary.exit_code())
}

fn build_jobs(cfg: &Config) -> Result<Vec<AccountJob>> {
    let timeout = cfg.http_timeout();
    let mut jobs = Vec::new();
    for cloud_cfg in cfg.enabled_clouds() {
        let account = cfg.cloud_account(cloud_cfg)?;
        info!(
            provider = %account.provider,
            account = %account.name,
            access_key = %mask_key(&account.access_key_id),
            regions = account.regions.len(),
            "account enabled"
        );
        let source = cloud::source_for(&account, timeout)
            .with_context(|| format!("building {} source for '{}'", account.provider, account.name))?;
        jobs.push(AccountJob {
            account,
            source,
            reconcile: cfg.reconcile_options(cloud_cfg),
            executor: cfg.executor_options(cloud_cfg),
        });
    }
    Ok(jobs)
}

fn print_summary(summary: &RunSummary) {
    println!();
    for (key, r) in &summary.results {
        let status = if r.is_clean() {
            "ok".green().bold()
        } else {
            "failed".red().bold()
        };
        println!(
            "  {:<28} {:<6} total {:>4}  +{} ~{} -{}  skipped {}  protected {}  failed {}",
            key, status, r.total, r.created, r.updated, r.deleted, r.skipped, r.protected, r.failed
        );
        if let Some(message) = &r.error_message {
            println!("  {:<28} {}", "", message.dimmed());
        }
    }
    let totals = summary.totals();
    println!(
        "\n  {} created {}, updated {}, deleted {}, failed {} in {:.1}s",
        "Total:".dimmed(),
        totals.created,
        totals.updated,
        totals.deleted,
        totals.failed,
        summary.duration_secs
    );
}

#[derive(Serialize)]
struct DiffView<'a> {
    create: Vec<String>,
    update: Vec<UpdateView<'a>>,
    delete: Vec<DeleteView<'a>>,
}

#[derive(Serialize)]
struct UpdateView<'a> {
    asset: String,
    changes: &'a [String],
}

#[derive(Serialize)]
struct DeleteView<'a> {
    asset: String,
    reason: &'a str,
}

fn print_preview(preview: &AccountPreview) -> Result<()> {
    let plan = &preview.plan;
    let node = if preview.node_exists {
        preview.node_path.normal()
    } else {
        format!("{} (would be created)", preview.node_path).yellow()
    };
    println!();
    println!("{} {} -> {}", "==".cyan().bold(), preview.key.bold(), node);
    println!(
        "   enumerated {}, create {}, update {}, delete {}, unchanged {}, protected {}, excluded {}",
        preview.enumerated,
        plan.to_create.len().to_string().green(),
        plan.to_update.len().to_string().yellow(),
        plan.to_delete.len().to_string().red(),
        plan.skipped,
        plan.protected,
        plan.excluded
    );
    if plan.is_noop() {
        return Ok(());
    }

    let view = DiffView {
        create: plan.to_create.iter().map(|i| i.subject()).collect(),
        update: plan
            .to_update
            .iter()
            .map(|u| UpdateView {
                asset: u.asset.subject(),
                changes: &u.reasons,
            })
            .collect(),
        delete: plan
            .to_delete
            .iter()
            .map(|d| DeleteView {
                asset: d.asset.subject(),
                reason: &d.reason,
            })
            .collect(),
    };
    let yaml = serde_yaml::to_string(&view).context("rendering plan")?;
    for line in yaml.lines() {
        println!("   {line}");
    }
    Ok(())
}
