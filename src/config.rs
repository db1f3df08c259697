//! Configuration: a YAML file with `${VAR}` expansion, layered under
//! `JMS_SYNC_`-prefixed environment variables.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::cloud::CloudAccount;
use crate::directory::jumpserver::JumpServerSettings;
use crate::domain::asset::{AssetDefaults, ProtocolPorts};
use crate::domain::instance::ProviderType;
use crate::error::ConfigError;
use crate::notify::dingtalk::DingTalkSettings;
use crate::retry::RetryPolicy;
use crate::sync::executor::ExecutorOptions;
use crate::sync::reconciler::ReconcileOptions;

pub const ENV_PREFIX: &str = "JMS_SYNC_";
const FILE_NAME: &str = "config.yaml";
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub jumpserver: Option<JumpServerConfig>,
    pub sync: SyncConfig,
    pub clouds: Option<Vec<CloudConfig>>,
    pub notification: NotificationConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JumpServerConfig {
    pub url: String,
    pub access_key_id: String,
    pub access_key_secret: String,
    pub org_id: String,
    pub verify_ssl: bool,
    pub timeout_secs: u64,
    pub root_node: String,
    pub protocols: ProtocolsConfig,
    pub platform_ids: PlatformIds,
    pub account_templates: AccountTemplates,
    pub retry: RetryConfig,
}

impl Default for JumpServerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            access_key_id: String::new(),
            access_key_secret: String::new(),
            org_id: "00000000-0000-0000-0000-000000000002".to_string(),
            verify_ssl: false,
            timeout_secs: 30,
            root_node: "DEFAULT".to_string(),
            protocols: ProtocolsConfig::default(),
            platform_ids: PlatformIds::default(),
            account_templates: AccountTemplates::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Ports are read wide so out-of-range values reach validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolsConfig {
    pub ssh_port: u32,
    pub rdp_port: u32,
}

impl Default for ProtocolsConfig {
    fn default() -> Self {
        Self {
            ssh_port: 22,
            rdp_port: 3389,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformIds {
    pub linux: u32,
    pub windows: u32,
}

impl Default for PlatformIds {
    fn default() -> Self {
        Self { linux: 1, windows: 5 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountTemplates {
    pub linux: Option<String>,
    pub windows: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_interval_ms: u64,
    pub factor: f64,
    pub max_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_interval_ms: 500,
            factor: 2.0,
            max_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub parallel_workers: usize,
    pub batch_size: usize,
    pub protected_ips: Vec<String>,
    pub no_delete: bool,
    pub run_retries: u32,
    pub run_retry_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            parallel_workers: 5,
            batch_size: 50,
            protected_ips: Vec::new(),
            no_delete: false,
            run_retries: 3,
            run_retry_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Provider name; `aliyun`/`huawei` or their Chinese names.
    #[serde(rename = "type")]
    pub provider: String,
    pub name: String,
    pub enabled: bool,
    pub access_key_id: String,
    pub access_key_secret: String,
    pub regions: Vec<String>,
    pub project_id: Option<String>,
    /// Gateway domain attached to every asset of this account.
    pub domain_id: Option<String>,
    pub protected_ips: Vec<String>,
    pub no_delete: bool,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            provider: String::new(),
            name: String::new(),
            enabled: true,
            access_key_id: String::new(),
            access_key_secret: String::new(),
            regions: Vec::new(),
            project_id: None,
            domain_id: None,
            protected_ips: Vec::new(),
            no_delete: false,
        }
    }
}

impl CloudConfig {
    pub fn provider_type(&self) -> Result<ProviderType, String> {
        ProviderType::from_str(&self.provider)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub dingtalk: DingTalkConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DingTalkConfig {
    pub enabled: bool,
    pub webhook: String,
    pub secret: Option<String>,
    pub at_mobiles: Vec<String>,
    pub at_all: bool,
    pub console_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

/// Where a config file is looked for, in order.
pub fn candidate_paths(explicit: Option<&Path>) -> Vec<PathBuf> {
    if let Some(path) = explicit {
        return vec![path.to_path_buf()];
    }
    let mut paths = vec![PathBuf::from(FILE_NAME)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("jms-sync").join(FILE_NAME));
    }
    paths
}

pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let candidates = candidate_paths(explicit);
    if let Some(found) = candidates.iter().find(|p| p.is_file()) {
        return Ok(found.clone());
    }
    Err(ConfigError::NotFound(candidates))
}

/// Locate, read, expand and parse the config. Validation is separate.
pub fn load(explicit: Option<&Path>) -> Result<(PathBuf, Config), ConfigError> {
    let path = resolve_path(explicit)?;
    let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let config = Config::from_yaml(&raw)?;
    Ok((path, config))
}

/// Replace `${VAR}` and `${VAR:default}` with environment values. An unset
/// variable without a default expands to an empty string.
pub fn expand_env(raw: &str) -> String {
    expand_with(raw, |name| std::env::var(name).ok())
}

fn expand_with(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let expr = &after[..end];
        let (name, default) = match expr.split_once(':') {
            Some((name, default)) => (name, Some(default)),
            None => (expr, None),
        };
        match lookup(name.trim()) {
            Some(value) => out.push_str(&value),
            None => out.push_str(default.unwrap_or_default()),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

impl Config {
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Figment::new()
            .merge(Yaml::string(&expand_env(raw)))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Collect every problem rather than stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        match &self.jumpserver {
            None => problems.push("missing `jumpserver` section".to_string()),
            Some(js) => {
                if !(js.url.starts_with("http://") || js.url.starts_with("https://")) {
                    problems.push(format!("jumpserver.url must be http(s), got '{}'", js.url));
                }
                if js.access_key_id.is_empty() || js.access_key_secret.is_empty() {
                    problems.push("jumpserver access_key_id and access_key_secret are required".to_string());
                }
                if js.root_node.trim().is_empty() {
                    problems.push("jumpserver.root_node must not be empty".to_string());
                }
                for (label, port) in [("ssh_port", js.protocols.ssh_port), ("rdp_port", js.protocols.rdp_port)] {
                    if !(1..=65535).contains(&port) {
                        problems.push(format!("jumpserver.protocols.{label} {port} is out of range 1-65535"));
                    }
                }
                if js.retry.max_attempts == 0 {
                    problems.push("jumpserver.retry.max_attempts must be at least 1".to_string());
                }
            }
        }

        match &self.clouds {
            None => problems.push("missing `clouds` section".to_string()),
            Some(clouds) => {
                let mut names = HashSet::new();
                for (i, cloud) in clouds.iter().enumerate() {
                    let label = if cloud.name.is_empty() {
                        format!("clouds[{i}]")
                    } else {
                        format!("cloud '{}'", cloud.name)
                    };
                    if cloud.name.trim().is_empty() {
                        problems.push(format!("{label}: name is required"));
                    } else if !names.insert(cloud.name.as_str()) {
                        problems.push(format!("{label}: duplicate cloud name"));
                    }
                    let provider = match cloud.provider_type() {
                        Ok(p) => Some(p),
                        Err(e) => {
                            problems.push(format!("{label}: {e}"));
                            None
                        }
                    };
                    if !cloud.enabled {
                        continue;
                    }
                    if cloud.access_key_id.is_empty() || cloud.access_key_secret.is_empty() {
                        problems.push(format!("{label}: access_key_id and access_key_secret are required"));
                    }
                    if cloud.regions.iter().all(|r| r.trim().is_empty()) {
                        problems.push(format!("{label}: at least one region is required"));
                    }
                    if provider == Some(ProviderType::Huawei)
                        && cloud.project_id.as_deref().map_or(true, |p| p.trim().is_empty())
                    {
                        problems.push(format!("{label}: huawei accounts need project_id"));
                    }
                }
            }
        }

        if self.sync.parallel_workers == 0 {
            problems.push("sync.parallel_workers must be at least 1".to_string());
        }
        if self.sync.batch_size == 0 {
            problems.push("sync.batch_size must be at least 1".to_string());
        }
        if !is_valid_level(&self.log.level) {
            problems.push(format!(
                "log.level '{}' is not one of {}",
                self.log.level,
                LOG_LEVELS.join(", ")
            ));
        }
        let dingtalk = &self.notification.dingtalk;
        if dingtalk.enabled && !dingtalk.webhook.starts_with("http") {
            problems.push("notification.dingtalk.webhook is required when enabled".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    fn jumpserver_section(&self) -> Result<&JumpServerConfig, ConfigError> {
        self.jumpserver
            .as_ref()
            .ok_or_else(|| ConfigError::Invalid(vec!["missing `jumpserver` section".to_string()]))
    }

    pub fn jumpserver_settings(&self) -> Result<JumpServerSettings, ConfigError> {
        let js = self.jumpserver_section()?;
        Ok(JumpServerSettings {
            url: js.url.clone(),
            access_key_id: js.access_key_id.clone(),
            access_key_secret: js.access_key_secret.clone(),
            org_id: js.org_id.clone(),
            verify_ssl: js.verify_ssl,
            timeout: self.http_timeout(),
            windows_platform_id: js.platform_ids.windows,
        })
    }

    pub fn root_node(&self) -> String {
        self.jumpserver
            .as_ref()
            .map(|js| js.root_node.clone())
            .unwrap_or_else(|| "DEFAULT".to_string())
    }

    /// Timeout shared by every outbound HTTP client.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.jumpserver.as_ref().map_or(30, |js| js.timeout_secs.max(1)))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let retry = self.jumpserver.as_ref().map(|js| js.retry.clone()).unwrap_or_default();
        RetryPolicy {
            max_attempts: retry.max_attempts.max(1),
            base_interval: Duration::from_millis(retry.base_interval_ms),
            factor: retry.factor,
            max_interval: Duration::from_millis(retry.max_interval_ms),
        }
    }

    pub fn enabled_clouds(&self) -> impl Iterator<Item = &CloudConfig> {
        self.clouds.iter().flatten().filter(|c| c.enabled)
    }

    pub fn cloud_account(&self, cloud: &CloudConfig) -> Result<CloudAccount, ConfigError> {
        let provider = cloud
            .provider_type()
            .map_err(|e| ConfigError::Invalid(vec![format!("cloud '{}': {e}", cloud.name)]))?;
        Ok(CloudAccount {
            provider,
            name: cloud.name.clone(),
            access_key_id: cloud.access_key_id.clone(),
            access_key_secret: cloud.access_key_secret.clone(),
            regions: cloud
                .regions
                .iter()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect(),
            project_id: cloud.project_id.clone(),
        })
    }

    fn ports(&self) -> ProtocolPorts {
        let defaults = ProtocolPorts::default();
        match &self.jumpserver {
            Some(js) => ProtocolPorts {
                ssh: u16::try_from(js.protocols.ssh_port).unwrap_or(defaults.ssh),
                rdp: u16::try_from(js.protocols.rdp_port).unwrap_or(defaults.rdp),
            },
            None => defaults,
        }
    }

    /// Global protected IPs united with the account's own.
    pub fn protected_ips(&self, cloud: &CloudConfig) -> HashSet<String> {
        self.sync
            .protected_ips
            .iter()
            .chain(&cloud.protected_ips)
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty())
            .collect()
    }

    pub fn reconcile_options(&self, cloud: &CloudConfig) -> ReconcileOptions {
        ReconcileOptions {
            protected_ips: self.protected_ips(cloud),
            no_delete: self.sync.no_delete || cloud.no_delete,
            ports: self.ports(),
        }
    }

    pub fn executor_options(&self, cloud: &CloudConfig) -> ExecutorOptions {
        let js = self.jumpserver.clone().unwrap_or_default();
        ExecutorOptions {
            concurrency: self.sync.parallel_workers.max(1),
            batch_size: self.sync.batch_size.max(1),
            protected_ips: self.protected_ips(cloud),
            defaults: AssetDefaults {
                ports: self.ports(),
                linux_platform_id: js.platform_ids.linux,
                windows_platform_id: js.platform_ids.windows,
                linux_account_template: js.account_templates.linux,
                windows_account_template: js.account_templates.windows,
                domain_id: cloud.domain_id.clone().filter(|d| !d.trim().is_empty()),
            },
        }
    }

    /// DingTalk settings when notifications are switched on.
    pub fn dingtalk_settings(&self) -> Option<DingTalkSettings> {
        let d = &self.notification.dingtalk;
        d.enabled.then(|| DingTalkSettings {
            webhook: d.webhook.clone(),
            secret: d.secret.clone().filter(|s| !s.is_empty()),
            at_mobiles: d.at_mobiles.clone(),
            at_all: d.at_all,
            console_url: d.console_url.clone().filter(|u| !u.is_empty()),
        })
    }
}

pub fn is_valid_level(level: &str) -> bool {
    LOG_LEVELS.contains(&level.trim().to_lowercase().as_str())
}
