//! Normalized instance: one cloud VM as seen by the reconciler.
//!
//! Built fresh from a provider listing on every run and never mutated
//! afterwards. Provider-specific shapes stop at the `cloud` module boundary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Cloud provider an account belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Aliyun,
    Huawei,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aliyun => "aliyun",
            Self::Huawei => "huawei",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "aliyun" | "阿里云" => Ok(Self::Aliyun),
            "huawei" | "华为云" => Ok(Self::Huawei),
            other => Err(format!("unknown provider type: {other}")),
        }
    }
}

/// Operating-system family; decides the access protocol of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OsFamily {
    #[default]
    Linux,
    Windows,
}

impl OsFamily {
    /// Classify a free-form OS/platform label. Anything mentioning Windows is
    /// Windows, everything else is treated as Linux.
    pub fn from_label(label: &str) -> Self {
        if label.to_lowercase().contains("windows") {
            Self::Windows
        } else {
            Self::Linux
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linux => "Linux",
            Self::Windows => "Windows",
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider metadata carried through to the asset comment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    pub instance_type: Option<String>,
    pub vpc_id: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedInstance {
    pub instance_id: Option<String>,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub hostname: String,
    pub os_family: OsFamily,
    pub region: String,
    pub provider_type: ProviderType,
    pub account_name: String,
    #[serde(default)]
    pub metadata: InstanceMetadata,
}

impl NormalizedInstance {
    /// Address the asset is registered under: private IP first, then public.
    pub fn ip(&self) -> Option<&str> {
        self.private_ip
            .as_deref()
            .filter(|ip| !ip.trim().is_empty())
            .or_else(|| self.public_ip.as_deref().filter(|ip| !ip.trim().is_empty()))
            .map(str::trim)
    }

    /// Stable identifier for log lines and error subjects.
    pub fn subject(&self) -> String {
        match (&self.instance_id, self.ip()) {
            (Some(id), Some(ip)) => format!("{} ({}, {})", self.hostname, id, ip),
            (Some(id), None) => format!("{} ({})", self.hostname, id),
            (None, Some(ip)) => format!("{} ({})", self.hostname, ip),
            (None, None) => self.hostname.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_instance(id: &str, ip: &str, hostname: &str, os: OsFamily) -> NormalizedInstance {
    NormalizedInstance {
        instance_id: (!id.is_empty()).then(|| id.to_string()),
        private_ip: (!ip.is_empty()).then(|| ip.to_string()),
        public_ip: None,
        hostname: hostname.to_string(),
        os_family: os,
        region: "cn-hangzhou".to_string(),
        provider_type: ProviderType::Aliyun,
        account_name: "prod".to_string(),
        metadata: InstanceMetadata::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_prefers_private_over_public() {
        let mut inst = test_instance("i-1", "10.0.0.1", "web-1", OsFamily::Linux);
        inst.public_ip = Some("47.0.0.1".into());
        assert_eq!(inst.ip(), Some("10.0.0.1"));

        inst.private_ip = Some("  ".into());
        assert_eq!(inst.ip(), Some("47.0.0.1"));

        inst.public_ip = None;
        assert_eq!(inst.ip(), None);
    }

    #[test]
    fn provider_type_accepts_localized_names() {
        assert_eq!("阿里云".parse::<ProviderType>(), Ok(ProviderType::Aliyun));
        assert_eq!("Huawei".parse::<ProviderType>(), Ok(ProviderType::Huawei));
        assert!("tencent".parse::<ProviderType>().is_err());
    }

    #[test]
    fn os_family_from_label() {
        assert_eq!(OsFamily::from_label("Windows Server 2019"), OsFamily::Windows);
        assert_eq!(OsFamily::from_label("CentOS 7.9 64位"), OsFamily::Linux);
        assert_eq!(OsFamily::from_label(""), OsFamily::Linux);
    }
}
