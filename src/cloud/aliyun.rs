//! Aliyun ECS `DescribeInstances` over the RPC API with signature v1.0.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha1::Sha1;
use tracing::debug;

use super::{mask_key, CloudAccount, InstanceSource, RegionListing};
use crate::domain::instance::{InstanceMetadata, NormalizedInstance, OsFamily, ProviderType};
use crate::error::CloudError;

const PROVIDER: &str = "aliyun";
const API_VERSION: &str = "2014-05-26";
const PAGE_SIZE: usize = 100;

type HmacSha1 = Hmac<Sha1>;

pub struct AliyunSource {
    account_name: String,
    access_key_id: String,
    access_key_secret: String,
    http: Client,
}

impl AliyunSource {
    pub fn new(account: &CloudAccount, timeout: Duration) -> Result<Self, CloudError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CloudError::Transport {
                provider: PROVIDER,
                message: format!("building HTTP client: {e}"),
            })?;
        debug!(account = %account.name, ak = %mask_key(&account.access_key_id), "aliyun source ready");
        Ok(Self {
            account_name: account.name.clone(),
            access_key_id: account.access_key_id.clone(),
            access_key_secret: account.access_key_secret.clone(),
            http,
        })
    }

    async fn fetch_page(&self, region: &str, page: usize) -> Result<DescribeInstancesResponse, CloudError> {
        let mut params = BTreeMap::new();
        params.insert("Action", "DescribeInstances".to_string());
        params.insert("Version", API_VERSION.to_string());
        params.insert("RegionId", region.to_string());
        params.insert("PageSize", PAGE_SIZE.to_string());
        params.insert("PageNumber", page.to_string());
        params.insert("Format", "JSON".to_string());
        params.insert("AccessKeyId", self.access_key_id.clone());
        params.insert("SignatureMethod", "HMAC-SHA1".to_string());
        params.insert("SignatureVersion", "1.0".to_string());
        params.insert("SignatureNonce", format!("{:032x}", rand::random::<u128>()));
        params.insert("Timestamp", Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string());

        let query = canonical_query(&params);
        let signature = sign(&self.access_key_secret, &query)?;
        let url = format!(
            "https://ecs.{region}.aliyuncs.com/?{query}&Signature={}",
            percent_encode(&signature)
        );

        let resp = self.http.get(&url).send().await.map_err(|e| CloudError::Transport {
            provider: PROVIDER,
            message: e.to_string(),
        })?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| CloudError::Transport {
            provider: PROVIDER,
            message: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(CloudError::Status {
                provider: PROVIDER,
                status: status.as_u16(),
                body: text,
            });
        }
        serde_json::from_str(&text).map_err(|e| CloudError::Decode {
            provider: PROVIDER,
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl InstanceSource for AliyunSource {
    fn provider(&self) -> ProviderType {
        ProviderType::Aliyun
    }

    async fn list_region(&self, region: &str) -> Result<RegionListing, CloudError> {
        let mut listing = RegionListing::default();
        let mut page = 1;
        loop {
            let resp = self.fetch_page(region, page).await?;
            listing.reported_total = resp.total_count;
            let fetched = resp.instances.instance.len();
            listing.instances.extend(
                resp.instances
                    .instance
                    .into_iter()
                    .map(|dto| dto.normalize(region, &self.account_name)),
            );
            if fetched < PAGE_SIZE || listing.instances.len() >= resp.total_count {
                break;
            }
            page += 1;
        }
        Ok(listing)
    }
}

/// RFC 3986 encoding as the RPC signature expects it.
fn percent_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
        .replace('*', "%2A")
        .replace("%7E", "~")
}

fn canonical_query(params: &BTreeMap<&str, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn sign(secret: &str, canonical_query: &str) -> Result<String, CloudError> {
    let string_to_sign = format!("GET&{}&{}", percent_encode("/"), percent_encode(canonical_query));
    let mut mac = HmacSha1::new_from_slice(format!("{secret}&").as_bytes()).map_err(|e| {
        CloudError::Signing {
            provider: PROVIDER,
            message: e.to_string(),
        }
    })?;
    mac.update(string_to_sign.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

// ── Wire format ────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesResponse {
    #[serde(default)]
    total_count: usize,
    #[serde(default)]
    instances: InstanceList,
}

#[derive(Debug, Default, Deserialize)]
struct InstanceList {
    #[serde(rename = "Instance", default)]
    instance: Vec<InstanceDto>,
}

#[derive(Debug, Default, Deserialize)]
struct IpList {
    #[serde(rename = "IpAddress", default)]
    ip_address: Vec<String>,
}

impl IpList {
    fn first(&self) -> Option<String> {
        self.ip_address.iter().find(|ip| !ip.is_empty()).cloned()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VpcAttributes {
    #[serde(default)]
    vpc_id: String,
    #[serde(default)]
    private_ip_address: IpList,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EipAddress {
    #[serde(default)]
    ip_address: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkInterface {
    #[serde(default)]
    primary_ip_address: String,
}

#[derive(Debug, Default, Deserialize)]
struct NetworkInterfaces {
    #[serde(rename = "NetworkInterface", default)]
    network_interface: Vec<NetworkInterface>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceDto {
    #[serde(default)]
    instance_id: String,
    #[serde(default)]
    instance_name: String,
    #[serde(default)]
    host_name: String,
    #[serde(rename = "OSType", default)]
    os_type: String,
    #[serde(rename = "OSName", default)]
    os_name: String,
    #[serde(default)]
    region_id: String,
    #[serde(default)]
    instance_type: String,
    #[serde(default)]
    creation_time: String,
    #[serde(default)]
    vpc_attributes: VpcAttributes,
    #[serde(default)]
    public_ip_address: IpList,
    #[serde(default)]
    eip_address: EipAddress,
    #[serde(default)]
    inner_ip_address: IpList,
    #[serde(default)]
    network_interfaces: NetworkInterfaces,
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl InstanceDto {
    fn normalize(self, region: &str, account_name: &str) -> NormalizedInstance {
        let private_ip = self
            .vpc_attributes
            .private_ip_address
            .first()
            .or_else(|| self.inner_ip_address.first())
            .or_else(|| {
                self.network_interfaces
                    .network_interface
                    .iter()
                    .map(|nic| nic.primary_ip_address.clone())
                    .find(|ip| !ip.is_empty())
            });
        let public_ip = self
            .public_ip_address
            .first()
            .or_else(|| non_empty(self.eip_address.ip_address.clone()));
        let os_label = if self.os_type.is_empty() {
            &self.os_name
        } else {
            &self.os_type
        };
        let hostname = [&self.instance_name, &self.host_name, &self.instance_id]
            .into_iter()
            .find(|s| !s.trim().is_empty())
            .cloned()
            .unwrap_or_default();

        NormalizedInstance {
            instance_id: non_empty(self.instance_id),
            private_ip,
            public_ip,
            hostname,
            os_family: OsFamily::from_label(os_label),
            region: non_empty(self.region_id).unwrap_or_else(|| region.to_string()),
            provider_type: ProviderType::Aliyun,
            account_name: account_name.to_string(),
            metadata: InstanceMetadata {
                instance_type: non_empty(self.instance_type),
                vpc_id: non_empty(self.vpc_attributes.vpc_id),
                created_at: non_empty(self.creation_time),
            },
        }
    }
}
