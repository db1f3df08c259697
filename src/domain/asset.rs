//! Directory-side records: host assets, hierarchy nodes, and mutation payloads.
//!
//! These are the canonical shapes the engine works with. The JumpServer wire
//! DTOs are mapped into them inside `directory::jumpserver` and never leak
//! past that boundary.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use super::instance::{NormalizedInstance, OsFamily};

/// One host record in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryAsset {
    pub id: String,
    pub name: String,
    pub address: String,
    pub platform: OsFamily,
    pub protocol: String,
    pub port: u16,
    pub node_id: String,
    #[serde(default)]
    pub comment: String,
    pub is_active: bool,
}

impl DirectoryAsset {
    pub fn subject(&self) -> String {
        format!("{} ({})", self.name, self.address)
    }
}

/// One entry of the `/ROOT/{provider}/{account}` hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryNode {
    pub id: String,
    pub key: String,
    pub value: String,
    pub parent_id: Option<String>,
}

/// Ports used for the protocol implied by an OS family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolPorts {
    pub ssh: u16,
    pub rdp: u16,
}

impl Default for ProtocolPorts {
    fn default() -> Self {
        Self { ssh: 22, rdp: 3389 }
    }
}

impl ProtocolPorts {
    pub fn for_family(&self, family: OsFamily) -> (&'static str, u16) {
        match family {
            OsFamily::Linux => ("ssh", self.ssh),
            OsFamily::Windows => ("rdp", self.rdp),
        }
    }
}

/// The state a directory asset should have to mirror an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetState {
    pub name: String,
    pub address: String,
    pub platform: OsFamily,
    pub protocol: &'static str,
    pub port: u16,
}

impl TargetState {
    /// Derive the target state. Returns `None` for an instance without an IP,
    /// which cannot be represented as an asset.
    pub fn for_instance(instance: &NormalizedInstance, ports: &ProtocolPorts) -> Option<Self> {
        let address = instance.ip()?.to_string();
        let (protocol, port) = ports.for_family(instance.os_family);
        Some(Self {
            name: instance.hostname.clone(),
            address,
            platform: instance.os_family,
            protocol,
            port,
        })
    }

    /// Human-readable differences between `asset` and this target, one per field.
    pub fn diff(&self, asset: &DirectoryAsset) -> Vec<String> {
        let mut reasons = Vec::new();
        if asset.address != self.address {
            reasons.push(format!("address {} -> {}", asset.address, self.address));
        }
        if asset.name != self.name {
            reasons.push(format!("name '{}' -> '{}'", asset.name, self.name));
        }
        if asset.platform != self.platform {
            reasons.push(format!("platform {} -> {}", asset.platform, self.platform));
        }
        if !asset.protocol.eq_ignore_ascii_case(self.protocol) || asset.port != self.port {
            reasons.push(format!(
                "protocol {}/{} -> {}/{}",
                asset.protocol, asset.port, self.protocol, self.port
            ));
        }
        reasons
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolSpec {
    pub name: String,
    pub port: u16,
}

/// Account template attached to a freshly created asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountTemplateRef {
    pub template: String,
    pub name: String,
    pub username: String,
    pub privileged: bool,
}

/// Directory-side settings needed to turn an instance into a payload.
#[derive(Debug, Clone, Default)]
pub struct AssetDefaults {
    pub ports: ProtocolPorts,
    pub linux_platform_id: u32,
    pub windows_platform_id: u32,
    pub linux_account_template: Option<String>,
    pub windows_account_template: Option<String>,
    pub domain_id: Option<String>,
}

impl AssetDefaults {
    fn platform_id(&self, family: OsFamily) -> u32 {
        match family {
            OsFamily::Linux => self.linux_platform_id,
            OsFamily::Windows => self.windows_platform_id,
        }
    }

    fn accounts(&self, family: OsFamily) -> Vec<AccountTemplateRef> {
        let template = match family {
            OsFamily::Linux => self.linux_account_template.as_ref(),
            OsFamily::Windows => self.windows_account_template.as_ref(),
        };
        template
            .map(|t| {
                let (name, username, privileged) = match family {
                    OsFamily::Linux => ("ROOT", "root", true),
                    OsFamily::Windows => ("Windows", "", false),
                };
                vec![AccountTemplateRef {
                    template: t.clone(),
                    name: name.to_string(),
                    username: username.to_string(),
                    privileged,
                }]
            })
            .unwrap_or_default()
    }
}

/// Body of a create or update call, independent of wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetPayload {
    pub name: String,
    pub address: String,
    pub platform: OsFamily,
    pub platform_id: u32,
    pub node_id: String,
    pub protocols: Vec<ProtocolSpec>,
    pub is_active: bool,
    pub comment: String,
    pub domain_id: Option<String>,
    pub accounts: Vec<AccountTemplateRef>,
}

impl AssetPayload {
    /// Build the payload for `instance` placed under `node_id`.
    ///
    /// Returns `None` when the instance has no usable address.
    pub fn for_instance(
        instance: &NormalizedInstance,
        node_id: &str,
        defaults: &AssetDefaults,
        now: DateTime<Local>,
    ) -> Option<Self> {
        let target = TargetState::for_instance(instance, &defaults.ports)?;
        Some(Self {
            name: target.name,
            address: target.address,
            platform: target.platform,
            platform_id: defaults.platform_id(target.platform),
            node_id: node_id.to_string(),
            protocols: vec![ProtocolSpec {
                name: target.protocol.to_string(),
                port: target.port,
            }],
            is_active: true,
            comment: render_comment(instance, now),
            domain_id: defaults.domain_id.clone(),
            accounts: defaults.accounts(target.platform),
        })
    }
}

/// Comment written on every managed asset. The `instance_id:` line is the
/// marker `sync::asset_index::extract_instance_id` reads back.
pub fn render_comment(instance: &NormalizedInstance, now: DateTime<Local>) -> String {
    let mut lines = vec![format!(
        "Synced by jms-sync at {}",
        now.format("%Y-%m-%d %H:%M:%S")
    )];
    let fields = [
        ("instance_id", instance.instance_id.as_deref()),
        ("instance_type", instance.metadata.instance_type.as_deref()),
        ("region", Some(instance.region.as_str())),
        ("vpc_id", instance.metadata.vpc_id.as_deref()),
    ];
    for (label, value) in fields {
        if let Some(v) = value.filter(|v| !v.is_empty()) {
            lines.push(format!("{label}: {v}"));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
pub(crate) fn test_asset(id: &str, ip: &str, name: &str, os: OsFamily, comment: &str) -> DirectoryAsset {
    let (protocol, port) = ProtocolPorts::default().for_family(os);
    DirectoryAsset {
        id: id.to_string(),
        name: name.to_string(),
        address: ip.to_string(),
        platform: os,
        protocol: protocol.to_string(),
        port,
        node_id: "node-prod".to_string(),
        comment: comment.to_string(),
        is_active: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::instance::test_instance;
    use chrono::TimeZone;

    #[test]
    fn diff_reports_each_changed_field() {
        let inst = test_instance("i-1", "10.0.0.1", "web-1", OsFamily::Windows);
        let target = TargetState::for_instance(&inst, &ProtocolPorts::default()).unwrap();
        let asset = test_asset("a1", "10.0.0.2", "web-old", OsFamily::Linux, "");

        let reasons = target.diff(&asset);
        assert_eq!(
            reasons,
            vec![
                "address 10.0.0.2 -> 10.0.0.1".to_string(),
                "name 'web-old' -> 'web-1'".to_string(),
                "platform Linux -> Windows".to_string(),
                "protocol ssh/22 -> rdp/3389".to_string(),
            ]
        );
    }

    #[test]
    fn diff_is_empty_for_current_asset() {
        let inst = test_instance("i-1", "10.0.0.1", "web-1", OsFamily::Linux);
        let target = TargetState::for_instance(&inst, &ProtocolPorts::default()).unwrap();
        let asset = test_asset("a1", "10.0.0.1", "web-1", OsFamily::Linux, "instance_id: i-1");
        assert!(target.diff(&asset).is_empty());
    }

    #[test]
    fn payload_carries_marker_and_templates() {
        let mut inst = test_instance("i-1", "10.0.0.1", "web-1", OsFamily::Linux);
        inst.metadata.instance_type = Some("ecs.g6.large".into());
        let defaults = AssetDefaults {
            linux_platform_id: 1,
            windows_platform_id: 5,
            linux_account_template: Some("tpl-linux".into()),
            ..Default::default()
        };
        let now = Local.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();

        let payload = AssetPayload::for_instance(&inst, "node-1", &defaults, now).unwrap();
        assert_eq!(payload.platform_id, 1);
        assert_eq!(payload.protocols[0], ProtocolSpec { name: "ssh".into(), port: 22 });
        assert_eq!(payload.accounts.len(), 1);
        assert_eq!(payload.accounts[0].username, "root");
        assert_eq!(
            payload.comment,
            "Synced by jms-sync at 2024-05-01 08:30:00\n\
             instance_id: i-1\n\
             instance_type: ecs.g6.large\n\
             region: cn-hangzhou"
        );
    }

    #[test]
    fn payload_requires_address() {
        let inst = test_instance("i-1", "", "web-1", OsFamily::Linux);
        let now = Local::now();
        assert!(AssetPayload::for_instance(&inst, "n", &AssetDefaults::default(), now).is_none());
    }
}
