//! DingTalk robot webhook. Posts one action card per account that changed,
//! failed, or carries an explanatory message.

use std::fmt::Write as _;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Local, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, info};
use url::Url;

use super::Notifier;
use crate::domain::result::{AccountReport, AssetChange};

const TITLE: &str = "JMS Asset Sync";
const ASSET_ROWS: usize = 10;
const ERROR_ROWS: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct DingTalkSettings {
    pub webhook: String,
    pub secret: Option<String>,
    pub at_mobiles: Vec<String>,
    pub at_all: bool,
    pub console_url: Option<String>,
}

pub struct DingTalkNotifier {
    client: reqwest::Client,
    settings: DingTalkSettings,
}

#[derive(Debug, Deserialize)]
struct WebhookResponse {
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

impl DingTalkNotifier {
    pub fn new(settings: DingTalkSettings, timeout: Duration) -> Result<Self> {
        Url::parse(&settings.webhook).context("parsing DingTalk webhook URL")?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building DingTalk HTTP client")?;
        Ok(Self { client, settings })
    }

    /// Webhook URL with `timestamp` and `sign` appended when a secret is set.
    fn signed_url(&self, timestamp_ms: i64) -> Result<Url> {
        let mut url = Url::parse(&self.settings.webhook).context("parsing DingTalk webhook URL")?;
        if let Some(secret) = self.settings.secret.as_deref().filter(|s| !s.is_empty()) {
            let sign = sign(secret, timestamp_ms)?;
            url.query_pairs_mut()
                .append_pair("timestamp", &timestamp_ms.to_string())
                .append_pair("sign", &sign);
        }
        Ok(url)
    }

    fn message(&self, report: &AccountReport, now: DateTime<Local>) -> Value {
        let mut text = render(report, now);
        if !self.settings.at_mobiles.is_empty() {
            text.push('\n');
            for mobile in &self.settings.at_mobiles {
                let _ = write!(text, "@{mobile} ");
            }
            text.push('\n');
        }

        let mut card = json!({
            "title": TITLE,
            "text": text,
            "hideAvatar": "0",
            "btnOrientation": "0",
        });
        if let Some(console) = self.settings.console_url.as_deref() {
            card["btns"] = json!([{ "title": "Open asset console", "actionURL": console }]);
        }
        json!({
            "msgtype": "actionCard",
            "actionCard": card,
            "at": {
                "atMobiles": self.settings.at_mobiles,
                "isAtAll": self.settings.at_all,
            },
        })
    }
}

#[async_trait]
impl Notifier for DingTalkNotifier {
    async fn notify(&self, report: &AccountReport) -> Result<()> {
        if !should_send(report) {
            debug!(account = %report.account_name, "no asset changes, notification skipped");
            return Ok(());
        }

        let url = self.signed_url(Utc::now().timestamp_millis())?;
        let body = self.message(report, Local::now());
        let response: WebhookResponse = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .context("sending DingTalk notification")?
            .error_for_status()
            .context("DingTalk returned error status")?
            .json()
            .await
            .context("decoding DingTalk response")?;

        if response.errcode != 0 {
            bail!("DingTalk rejected message: {} (errcode {})", response.errmsg, response.errcode);
        }
        info!(
            provider = %report.provider_type,
            account = %report.account_name,
            "DingTalk notification sent"
        );
        Ok(())
    }
}

/// base64(HMAC-SHA256(secret, "{timestamp}\n{secret}")).
pub fn sign(secret: &str, timestamp_ms: i64) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid DingTalk secret: {e}"))?;
    mac.update(format!("{timestamp_ms}\n{secret}").as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

pub fn should_send(report: &AccountReport) -> bool {
    report.is_failure || report.sync_result.has_changes() || report.sync_result.error_message.is_some()
}

/// Markdown body of the action card.
pub fn render(report: &AccountReport, now: DateTime<Local>) -> String {
    let r = &report.sync_result;
    let mut out = String::new();

    let _ = writeln!(out, "# {TITLE}");
    let _ = writeln!(out, "### **Cloud** {} - {}\n", report.provider_type, report.account_name);
    let _ = writeln!(out, "### **Time** {}\n", now.format("%Y-%m-%d %H:%M:%S"));
    if report.is_failure {
        let status = r.error_message.as_deref().unwrap_or("completed with failed operations");
        let _ = writeln!(out, "**Status: FAILED** {}\n", cell(status));
    } else if let Some(message) = r.error_message.as_deref() {
        let _ = writeln!(out, "**Note** {}\n", cell(message));
    }

    out.push_str("### **Result**\n\n| Metric | Value |\n|---|---|\n");
    let _ = writeln!(out, "| Total | {} |", r.total);
    if let Some(expected) = r.expected_total {
        let _ = writeln!(out, "| Reported by cloud | {expected} |");
    }
    let _ = writeln!(out, "| Created | {} |", r.created);
    let _ = writeln!(out, "| Updated | {} |", r.updated);
    let _ = writeln!(out, "| Deleted | {} |", r.deleted);
    let _ = writeln!(out, "| Failed | {} |", r.failed);
    let _ = writeln!(out, "| Duration | {:.2}s |\n", r.duration_secs);

    asset_table(&mut out, "Created assets", &report.created_assets);
    asset_table(&mut out, "Deleted assets", &report.deleted_assets);

    if !r.errors.is_empty() {
        out.push_str("\n### **Errors**\n\n| Asset | Error |\n|---|---|\n");
        for e in r.errors.iter().take(ERROR_ROWS) {
            let _ = writeln!(out, "| {} | {}: {} |", cell(&e.subject), e.operation, cell(&e.message));
        }
        if r.errors.len() > ERROR_ROWS {
            let _ = writeln!(out, "\n*{} errors in total*", r.errors.len());
        }
    }
    out
}

fn asset_table(out: &mut String, heading: &str, assets: &[AssetChange]) {
    if assets.is_empty() {
        return;
    }
    let _ = write!(out, "\n### **{heading}**\n\n| Hostname | IP | Platform |\n|---|---|---|\n");
    for a in assets.iter().take(ASSET_ROWS) {
        let _ = writeln!(out, "| {} | {} | {} |", cell(&a.name), cell(&a.address), a.platform);
    }
    if assets.len() > ASSET_ROWS {
        let _ = writeln!(out, "\n*{} assets in total*", assets.len());
    }
}

/// Keep a value inside one markdown table cell.
fn cell(value: &str) -> String {
    value.replace('|', "\\|").replace('\n', " ")
}
