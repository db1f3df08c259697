//! JumpServer REST client with access-key signature auth.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{ACCEPT, AUTHORIZATION, DATE};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::signature;
use super::DirectoryClient;
use crate::domain::asset::{AssetPayload, DirectoryAsset, DirectoryNode, ProtocolSpec};
use crate::domain::instance::OsFamily;
use crate::error::DirectoryError;
use crate::retry::RetryPolicy;

const PAGE_LIMIT: usize = 100;
const MAX_ERROR_BODY: usize = 512;

/// Connection settings for one JumpServer organisation.
#[derive(Debug, Clone)]
pub struct JumpServerSettings {
    pub url: String,
    pub access_key_id: String,
    pub access_key_secret: String,
    pub org_id: String,
    pub verify_ssl: bool,
    pub timeout: Duration,
    pub windows_platform_id: u32,
}

pub struct JumpServerClient {
    base_url: String,
    key_id: String,
    secret: String,
    org_id: String,
    windows_platform_id: u32,
    http: Client,
    retry: RetryPolicy,
}

impl JumpServerClient {
    pub fn new(settings: &JumpServerSettings, retry: RetryPolicy) -> Result<Self, DirectoryError> {
        let http = Client::builder()
            .timeout(settings.timeout)
            .danger_accept_invalid_certs(!settings.verify_ssl)
            .build()
            .map_err(|e| DirectoryError::Transport(format!("building HTTP client: {e}")))?;
        Ok(Self {
            base_url: settings.url.trim_end_matches('/').to_string(),
            key_id: settings.access_key_id.clone(),
            secret: settings.access_key_secret.clone(),
            org_id: settings.org_id.clone(),
            windows_platform_id: settings.windows_platform_id,
            http,
            retry,
        })
    }

    /// Signed round-trip against a cheap endpoint. Verifies URL, keys and org.
    pub async fn check_connectivity(&self) -> Result<(), DirectoryError> {
        self.request(Method::GET, "/api/v1/terminal/status/", None).await?;
        Ok(())
    }

    // ── Internal helpers ───────────────────────────────────

    async fn request(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<String, DirectoryError> {
        let operation = format!("{method} {path_and_query}");
        self.retry
            .run(&operation, || self.request_once(method.clone(), path_and_query, body))
            .await
    }

    async fn request_once(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<String, DirectoryError> {
        let date = signature::http_date(Utc::now());
        let auth = signature::authorization(
            &self.key_id,
            &self.secret,
            method.as_str(),
            path_and_query,
            &date,
        )
        .map_err(|e| DirectoryError::Transport(format!("signing request: {e}")))?;

        let url = format!("{}{}", self.base_url, path_and_query);
        debug!(%method, %url, "directory request");
        let mut req = self
            .http
            .request(method, &url)
            .header(ACCEPT, signature::ACCEPT)
            .header(DATE, &date)
            .header(AUTHORIZATION, auth)
            .header("X-JMS-ORG", &self.org_id);
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(DirectoryError::from_status(status.as_u16(), truncate(&text)));
        }
        Ok(text)
    }

    async fn get<T: DeserializeOwned>(&self, path_and_query: &str) -> Result<T, DirectoryError> {
        let text = self.request(Method::GET, path_and_query, None).await?;
        decode(&text)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, DirectoryError> {
        let text = self.request(method, path, Some(&body)).await?;
        decode(&text)
    }

    fn to_asset(&self, dto: HostDto, queried_node: &str) -> DirectoryAsset {
        let platform = match &dto.platform {
            PlatformRef::Object { name: Some(name), .. } | PlatformRef::Name(name) => {
                OsFamily::from_label(name)
            }
            PlatformRef::Object { id: Some(id), .. } => self.family_of(id),
            PlatformRef::Id(id) => self.family_of(&serde_json::Value::from(*id)),
            PlatformRef::Object { .. } => OsFamily::Linux,
        };
        let node_ids: Vec<&str> = dto.nodes.iter().map(NodeRef::id).collect();
        let node_id = if node_ids.contains(&queried_node) {
            queried_node.to_string()
        } else {
            node_ids.first().map(|s| s.to_string()).unwrap_or_default()
        };
        let protocol = dto.protocols.first();
        DirectoryAsset {
            id: dto.id,
            name: dto.name,
            address: dto.address,
            platform,
            protocol: protocol.map(|p| p.name.clone()).unwrap_or_default(),
            port: protocol.map(|p| p.port).unwrap_or_default(),
            node_id,
            comment: dto.comment.unwrap_or_default(),
            is_active: dto.is_active,
        }
    }

    fn family_of(&self, id: &serde_json::Value) -> OsFamily {
        let id = match id {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        };
        if id == Some(u64::from(self.windows_platform_id)) {
            OsFamily::Windows
        } else {
            OsFamily::Linux
        }
    }
}

#[async_trait]
impl DirectoryClient for JumpServerClient {
    async fn resolve_children(
        &self,
        parent_key: Option<&str>,
    ) -> Result<Vec<DirectoryNode>, DirectoryError> {
        let path = match parent_key {
            Some(key) => format!("/api/v1/assets/nodes/children/?key={}", encode(key)),
            None => "/api/v1/assets/nodes/children/".to_string(),
        };
        let listing: Listing<NodeDto> = self.get(&path).await?;
        Ok(listing.into_items().into_iter().map(NodeDto::into_node).collect())
    }

    async fn create_child_node(
        &self,
        parent_id: &str,
        value: &str,
    ) -> Result<DirectoryNode, DirectoryError> {
        let path = format!("/api/v1/assets/nodes/{parent_id}/children/");
        let dto: NodeDto = self
            .send_json(Method::POST, &path, serde_json::json!({ "value": value }))
            .await?;
        info!(parent_id, value, node_id = %dto.id, "created directory node");
        let mut node = dto.into_node();
        node.parent_id = Some(parent_id.to_string());
        Ok(node)
    }

    async fn list_assets(&self, node_id: &str) -> Result<Vec<DirectoryAsset>, DirectoryError> {
        let mut assets = Vec::new();
        let mut offset = 0;
        loop {
            let path = format!(
                "/api/v1/assets/hosts/?node={}&limit={PAGE_LIMIT}&offset={offset}",
                encode(node_id)
            );
            let page: Listing<HostDto> = self.get(&path).await?;
            let (count, has_next, items) = page.into_page();
            let fetched = items.len();
            assets.extend(items.into_iter().map(|dto| self.to_asset(dto, node_id)));
            offset += fetched;
            if fetched == 0 || !has_next || count.is_some_and(|c| offset >= c) {
                break;
            }
        }
        debug!(node_id, count = assets.len(), "listed directory assets");
        Ok(assets)
    }

    async fn create_asset(&self, payload: &AssetPayload) -> Result<DirectoryAsset, DirectoryError> {
        let body = host_body(payload, true)?;
        let dto: HostDto = self
            .send_json(Method::POST, "/api/v1/assets/hosts/", body)
            .await?;
        Ok(self.to_asset(dto, &payload.node_id))
    }

    async fn update_asset(
        &self,
        id: &str,
        payload: &AssetPayload,
    ) -> Result<DirectoryAsset, DirectoryError> {
        let body = host_body(payload, false)?;
        let path = format!("/api/v1/assets/hosts/{id}/");
        let dto: HostDto = self.send_json(Method::PATCH, &path, body).await?;
        Ok(self.to_asset(dto, &payload.node_id))
    }

    async fn delete_asset(&self, id: &str) -> Result<(), DirectoryError> {
        let path = format!("/api/v1/assets/hosts/{id}/");
        self.request(Method::DELETE, &path, None).await?;
        Ok(())
    }
}

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, DirectoryError> {
    serde_json::from_str(body).map_err(|e| DirectoryError::Decode(e.to_string()))
}

// ── Wire format ────────────────────────────────────────────

/// Endpoints answer either with a bare array or a limit/offset page.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Page {
        count: Option<usize>,
        next: Option<String>,
        results: Vec<T>,
    },
    Plain(Vec<T>),
}

impl<T> Listing<T> {
    fn into_items(self) -> Vec<T> {
        self.into_page().2
    }

    fn into_page(self) -> (Option<usize>, bool, Vec<T>) {
        match self {
            Self::Page {
                count,
                next,
                results,
            } => (count, next.is_some(), results),
            Self::Plain(items) => (None, false, items),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NodeDto {
    id: String,
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    parent: Option<String>,
}

impl NodeDto {
    fn into_node(self) -> DirectoryNode {
        DirectoryNode {
            id: self.id,
            key: self.key,
            value: self.value,
            parent_id: self.parent.filter(|p| !p.is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PlatformRef {
    Object {
        #[serde(default, alias = "pk")]
        id: Option<serde_json::Value>,
        #[serde(default)]
        name: Option<String>,
    },
    Id(u64),
    Name(String),
}

impl Default for PlatformRef {
    fn default() -> Self {
        Self::Object { id: None, name: None }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NodeRef {
    Object {
        #[serde(alias = "pk")]
        id: String,
    },
    Id(String),
}

impl NodeRef {
    fn id(&self) -> &str {
        match self {
            Self::Object { id } | Self::Id(id) => id,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct HostDto {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default, alias = "ip")]
    address: String,
    #[serde(default)]
    platform: PlatformRef,
    #[serde(default)]
    nodes: Vec<NodeRef>,
    #[serde(default)]
    protocols: Vec<ProtocolSpec>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default = "default_true")]
    is_active: bool,
}

#[derive(Serialize)]
struct PkRef<T> {
    pk: T,
}

#[derive(Serialize)]
struct AccountBody<'a> {
    template: &'a str,
    name: &'a str,
    username: &'a str,
    secret_type: &'static str,
    privileged: bool,
}

#[derive(Serialize)]
struct HostBody<'a> {
    name: &'a str,
    address: &'a str,
    platform: PkRef<u32>,
    nodes: Vec<PkRef<&'a str>>,
    protocols: &'a [ProtocolSpec],
    is_active: bool,
    comment: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    domain: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    accounts: Vec<AccountBody<'a>>,
}

/// Account templates are only sent on create; updates leave accounts alone.
fn host_body(payload: &AssetPayload, with_accounts: bool) -> Result<serde_json::Value, DirectoryError> {
    let accounts = if with_accounts {
        payload
            .accounts
            .iter()
            .map(|a| AccountBody {
                template: &a.template,
                name: &a.name,
                username: &a.username,
                secret_type: "password",
                privileged: a.privileged,
            })
            .collect()
    } else {
        Vec::new()
    };
    let body = HostBody {
        name: &payload.name,
        address: &payload.address,
        platform: PkRef {
            pk: payload.platform_id,
        },
        nodes: vec![PkRef {
            pk: payload.node_id.as_str(),
        }],
        protocols: &payload.protocols,
        is_active: payload.is_active,
        comment: &payload.comment,
        domain: payload.domain_id.as_deref().filter(|d| !d.is_empty()),
        accounts,
    };
    serde_json::to_value(&body).map_err(|e| DirectoryError::Decode(format!("encoding host body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::asset::AccountTemplateRef;

    fn client() -> JumpServerClient {
        JumpServerClient::new(
            &JumpServerSettings {
                url: "https://jms.example.com/".into(),
                access_key_id: "ak".into(),
                access_key_secret: "sk".into(),
                org_id: "00000000-0000-0000-0000-000000000002".into(),
                verify_ssl: true,
                timeout: Duration::from_secs(5),
                windows_platform_id: 5,
            },
            RetryPolicy::none(),
        )
        .unwrap()
    }

    #[test]
    fn host_page_maps_to_canonical_assets() {
        let body = r#"{
            "count": 2,
            "next": null,
            "results": [
                {"id": "a1", "name": "web-1", "address": "10.0.0.1",
                 "platform": {"id": 1, "name": "Linux"},
                 "nodes": [{"id": "other"}, {"id": "n1"}],
                 "protocols": [{"name": "ssh", "port": 22}],
                 "comment": "instance_id: i-1", "is_active": true},
                {"id": "a2", "name": "win-1", "address": "10.0.0.2",
                 "platform": {"pk": 5},
                 "nodes": ["n2"],
                 "protocols": [{"name": "rdp", "port": 3389}]}
            ]
        }"#;
        let page: Listing<HostDto> = decode(body).unwrap();
        let (count, has_next, items) = page.into_page();
        assert_eq!(count, Some(2));
        assert!(!has_next);

        let c = client();
        let assets: Vec<_> = items.into_iter().map(|dto| c.to_asset(dto, "n1")).collect();
        assert_eq!(assets[0].node_id, "n1");
        assert_eq!(assets[0].platform, OsFamily::Linux);
        assert_eq!(assets[0].comment, "instance_id: i-1");
        assert_eq!(assets[1].node_id, "n2");
        assert_eq!(assets[1].platform, OsFamily::Windows);
        assert_eq!((assets[1].protocol.as_str(), assets[1].port), ("rdp", 3389));
        assert!(assets[1].is_active);
    }

    #[test]
    fn node_listing_accepts_bare_array() {
        let body = r#"[{"id": "n1", "key": "1:3", "value": "aliyun", "name": "aliyun"}]"#;
        let listing: Listing<NodeDto> = decode(body).unwrap();
        let nodes: Vec<_> = listing.into_items().into_iter().map(NodeDto::into_node).collect();
        assert_eq!(nodes[0].key, "1:3");
        assert_eq!(nodes[0].parent_id, None);
    }

    #[test]
    fn host_body_shape() {
        let payload = AssetPayload {
            name: "web-1".into(),
            address: "10.0.0.1".into(),
            platform: OsFamily::Linux,
            platform_id: 1,
            node_id: "n1".into(),
            protocols: vec![ProtocolSpec { name: "ssh".into(), port: 22 }],
            is_active: true,
            comment: "c".into(),
            domain_id: Some(String::new()),
            accounts: vec![AccountTemplateRef {
                template: "tpl".into(),
                name: "ROOT".into(),
                username: "root".into(),
                privileged: true,
            }],
        };

        let created = host_body(&payload, true).unwrap();
        assert_eq!(created["platform"]["pk"], 1);
        assert_eq!(created["nodes"][0]["pk"], "n1");
        assert_eq!(created["accounts"][0]["secret_type"], "password");
        assert!(created.get("domain").is_none());

        let updated = host_body(&payload, false).unwrap();
        assert!(updated.get("accounts").is_none());
    }

    #[test]
    fn node_key_is_query_encoded() {
        assert_eq!(encode("1:2"), "1%3A2");
    }

    #[test]
    fn error_body_is_truncated() {
        let long = "x".repeat(MAX_ERROR_BODY + 10);
        assert_eq!(truncate(&long).len(), MAX_ERROR_BODY + 3);
        assert_eq!(truncate("short"), "short");
    }
}
