//! Post-sync notifications.

pub mod dingtalk;

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::result::AccountReport;

pub use dingtalk::DingTalkNotifier;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one account's report. Failures are the caller's to log; they
    /// never change the sync outcome.
    async fn notify(&self, report: &AccountReport) -> Result<()>;
}
