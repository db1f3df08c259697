//! Huawei Cloud ECS `ListServersDetails` with SDK-HMAC-SHA256 signing.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{mask_key, CloudAccount, InstanceSource, RegionListing};
use crate::domain::instance::{InstanceMetadata, NormalizedInstance, OsFamily, ProviderType};
use crate::error::CloudError;

const PROVIDER: &str = "huawei";
const PAGE_LIMIT: usize = 100;
const ALGORITHM: &str = "SDK-HMAC-SHA256";
const JSON: &str = "application/json";

type HmacSha256 = Hmac<Sha256>;

pub struct HuaweiSource {
    account_name: String,
    access_key_id: String,
    access_key_secret: String,
    project_id: String,
    http: Client,
}

impl HuaweiSource {
    pub fn new(account: &CloudAccount, timeout: Duration) -> Result<Self, CloudError> {
        let project_id = account
            .project_id
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| CloudError::Signing {
                provider: PROVIDER,
                message: format!("account '{}' has no project_id", account.name),
            })?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CloudError::Transport {
                provider: PROVIDER,
                message: format!("building HTTP client: {e}"),
            })?;
        debug!(account = %account.name, ak = %mask_key(&account.access_key_id), "huawei source ready");
        Ok(Self {
            account_name: account.name.clone(),
            access_key_id: account.access_key_id.clone(),
            access_key_secret: account.access_key_secret.clone(),
            project_id,
            http,
        })
    }

    /// `offset` on this API is a 1-based page number.
    async fn fetch_page(&self, region: &str, page: usize) -> Result<ListServersResponse, CloudError> {
        let host = format!("ecs.{region}.myhuaweicloud.com");
        let path = format!("/v1/{}/cloudservers/detail", self.project_id);
        let mut query = BTreeMap::new();
        query.insert("limit".to_string(), PAGE_LIMIT.to_string());
        query.insert("offset".to_string(), page.to_string());

        let sdk_date = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let request = SignedRequest {
            method: "GET",
            host: &host,
            path: &path,
            query: &query,
            sdk_date: &sdk_date,
            body: b"",
        };
        let authorization = request.authorization(&self.access_key_id, &self.access_key_secret)?;

        let url = format!("https://{host}{path}?{}", canonical_query(&query));
        let resp = self
            .http
            .get(&url)
            .header(CONTENT_TYPE, JSON)
            .header("X-Sdk-Date", &sdk_date)
            .header(AUTHORIZATION, authorization)
            .send()
            .await
            .map_err(|e| CloudError::Transport {
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
impl InstanceSource for HuaweiSource {
    fn provider(&self) -> ProviderType {
        ProviderType::Huawei
    }

    async fn list_region(&self, region: &str) -> Result<RegionListing, CloudError> {
        let mut listing = RegionListing::default();
        let mut page = 1;
        loop {
            let resp = self.fetch_page(region, page).await?;
            listing.reported_total = resp.count;
            let fetched = resp.servers.len();
            listing.instances.extend(
                resp.servers
                    .into_iter()
                    .map(|dto| dto.normalize(region, &self.account_name)),
            );
            if fetched < PAGE_LIMIT || listing.instances.len() >= resp.count {
                break;
            }
            page += 1;
        }
        Ok(listing)
    }
}

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
        .replace('*', "%2A")
        .replace("%7E", "~")
}

fn canonical_query(query: &BTreeMap<String, String>) -> String {
    query
        .iter()
        .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

struct SignedRequest<'a> {
    method: &'a str,
    host: &'a str,
    path: &'a str,
    query: &'a BTreeMap<String, String>,
    sdk_date: &'a str,
    body: &'a [u8],
}

impl SignedRequest<'_> {
    const SIGNED_HEADERS: &'static str = "content-type;host;x-sdk-date";

    fn canonical_request(&self) -> String {
        let uri = if self.path.ends_with('/') {
            self.path.to_string()
        } else {
            format!("{}/", self.path)
        };
        let headers = format!(
            "content-type:{JSON}\nhost:{}\nx-sdk-date:{}\n",
            self.host, self.sdk_date
        );
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            self.method,
            uri,
            canonical_query(self.query),
            headers,
            Self::SIGNED_HEADERS,
            hex::encode(Sha256::digest(self.body))
        )
    }

    fn signature(&self, secret: &str) -> Result<String, CloudError> {
        let string_to_sign = format!(
            "{ALGORITHM}\n{}\n{}",
            self.sdk_date,
            hex::encode(Sha256::digest(self.canonical_request().as_bytes()))
        );
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| CloudError::Signing {
            provider: PROVIDER,
            message: e.to_string(),
        })?;
        mac.update(string_to_sign.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn authorization(&self, access_key: &str, secret: &str) -> Result<String, CloudError> {
        Ok(format!(
            "{ALGORITHM} Access={access_key}, SignedHeaders={}, Signature={}",
            Self::SIGNED_HEADERS,
            self.signature(secret)?
        ))
    }
}

// ── Wire format ────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ListServersResponse {
    #[serde(default)]
    count: usize,
    #[serde(default)]
    servers: Vec<ServerDto>,
}

#[derive(Debug, Deserialize)]
struct AddressDto {
    addr: String,
    #[serde(rename = "OS-EXT-IPS:type", default)]
    kind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerMetadata {
    #[serde(default)]
    os_type: Option<String>,
    #[serde(default)]
    vpc_id: Option<String>,
    #[serde(default)]
    image_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Flavor {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ImageRef {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServerDto {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    addresses: HashMap<String, Vec<AddressDto>>,
    #[serde(default)]
    metadata: ServerMetadata,
    #[serde(default)]
    flavor: Flavor,
    #[serde(default)]
    image: ImageRef,
    #[serde(default)]
    created: Option<String>,
}

fn is_private(addr: &str) -> bool {
    addr.parse::<Ipv4Addr>().is_ok_and(|ip| ip.is_private())
}

impl ServerDto {
    fn normalize(self, region: &str, account_name: &str) -> NormalizedInstance {
        let mut networks: Vec<_> = self.addresses.into_iter().collect();
        networks.sort_by(|a, b| a.0.cmp(&b.0));

        let mut private_ip = None;
        let mut public_ip = None;
        for addr in networks.iter().flat_map(|(_, list)| list) {
            let private = match addr.kind.as_deref() {
                Some("fixed") => true,
                Some("floating") => false,
                _ => is_private(&addr.addr),
            };
            let slot = if private { &mut private_ip } else { &mut public_ip };
            if slot.is_none() && !addr.addr.is_empty() {
                *slot = Some(addr.addr.clone());
            }
        }

        let os_label = [
            self.metadata.os_type.as_deref(),
            self.metadata.image_name.as_deref(),
            self.image.name.as_deref(),
        ]
        .into_iter()
        .flatten()
        .find(|s| !s.is_empty())
        .unwrap_or_default();

        NormalizedInstance {
            instance_id: (!self.id.is_empty()).then(|| self.id.clone()),
            private_ip,
            public_ip,
            hostname: if self.name.is_empty() { self.id } else { self.name },
            os_family: OsFamily::from_label(os_label),
            region: region.to_string(),
            provider_type: ProviderType::Huawei,
            account_name: account_name.to_string(),
            metadata: InstanceMetadata {
                instance_type: self.flavor.id.filter(|s| !s.is_empty()),
                vpc_id: self.metadata.vpc_id.filter(|s| !s.is_empty()),
                created_at: self.created.filter(|s| !s.is_empty()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_known_vector() {
        let mut query = BTreeMap::new();
        query.insert("limit".to_string(), "100".to_string());
        query.insert("offset".to_string(), "1".to_string());
        let request = SignedRequest {
            method: "GET",
            host: "ecs.cn-north-4.myhuaweicloud.com",
            path: "/v1/proj-1/cloudservers/detail",
            query: &query,
            sdk_date: "20240101T000000Z",
            body: b"",
        };
        assert_eq!(
            request.signature("hwsecret").unwrap(),
            "454407b37aa98b07da1a3ec9922ab13199f8c7d5a7000d60228d5f7310136866"
        );
        assert!(request
            .authorization("hwak", "hwsecret")
            .unwrap()
            .starts_with("SDK-HMAC-SHA256 Access=hwak, SignedHeaders=content-type;host;x-sdk-date, Signature="));
    }

    #[test]
    fn address_types_and_rfc1918_fallback() {
        let body = r#"{
            "count": 2,
            "servers": [
                {"id": "s-1", "name": "db-1",
                 "addresses": {"net-a": [
                    {"addr": "121.0.0.9", "OS-EXT-IPS:type": "floating"},
                    {"addr": "192.168.0.9", "OS-EXT-IPS:type": "fixed"}
                 ]},
                 "metadata": {"os_type": "Linux", "vpc_id": "vpc-9"},
                 "flavor": {"id": "s6.large.2"},
                 "created": "2024-01-01T00:00:00Z"},
                {"id": "s-2", "name": "win-2",
                 "addresses": {"net-b": [{"addr": "10.1.0.2"}, {"addr": "8.8.4.4"}]},
                 "image": {"name": "Windows Server 2019"}}
            ]
        }"#;
        let resp: ListServersResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.count, 2);
        let out: Vec<_> = resp
            .servers
            .into_iter()
            .map(|s| s.normalize("cn-north-4", "hw"))
            .collect();

        assert_eq!(out[0].private_ip.as_deref(), Some("192.168.0.9"));
        assert_eq!(out[0].public_ip.as_deref(), Some("121.0.0.9"));
        assert_eq!(out[0].metadata.instance_type.as_deref(), Some("s6.large.2"));
        assert_eq!(out[0].os_family, OsFamily::Linux);

        assert_eq!(out[1].private_ip.as_deref(), Some("10.1.0.2"));
        assert_eq!(out[1].public_ip.as_deref(), Some("8.8.4.4"));
        assert_eq!(out[1].os_family, OsFamily::Windows);
        assert_eq!(out[1].provider_type, ProviderType::Huawei);
    }
}
