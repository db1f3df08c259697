//! Cloud instance sources. Read-only towards the provider.

pub mod aliyun;
pub mod huawei;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::domain::instance::{NormalizedInstance, ProviderType};
use crate::error::CloudError;

/// Credentials and scope of one cloud account.
#[derive(Debug, Clone)]
pub struct CloudAccount {
    pub provider: ProviderType,
    pub name: String,
    pub access_key_id: String,
    pub access_key_secret: String,
    pub regions: Vec<String>,
    pub project_id: Option<String>,
}

/// One region's instances plus the total the provider claims to have.
#[derive(Debug, Clone, Default)]
pub struct RegionListing {
    pub instances: Vec<NormalizedInstance>,
    pub reported_total: usize,
}

/// All regions of an account, concatenated.
#[derive(Debug, Clone, Default)]
pub struct AccountListing {
    pub instances: Vec<NormalizedInstance>,
    pub reported_total: usize,
    pub failed_regions: Vec<String>,
}

#[async_trait]
pub trait InstanceSource: Send + Sync {
    fn provider(&self) -> ProviderType;

    async fn list_region(&self, region: &str) -> Result<RegionListing, CloudError>;
}

/// Build the source for `account` using a shared HTTP timeout.
pub fn source_for(account: &CloudAccount, timeout: Duration) -> Result<Arc<dyn InstanceSource>, CloudError> {
    Ok(match account.provider {
        ProviderType::Aliyun => Arc::new(aliyun::AliyunSource::new(account, timeout)?),
        ProviderType::Huawei => Arc::new(huawei::HuaweiSource::new(account, timeout)?),
    })
}

/// Enumerate every region of `account`. A failing region is logged and
/// contributes no instances; reported totals are summed over the regions
/// that answered.
pub async fn enumerate_account(source: &dyn InstanceSource, account: &CloudAccount) -> AccountListing {
    let mut listing = AccountListing::default();
    for region in &account.regions {
        match source.list_region(region).await {
            Ok(region_listing) => {
                info!(
                    provider = %source.provider(),
                    account = %account.name,
                    region = %region,
                    count = region_listing.instances.len(),
                    reported = region_listing.reported_total,
                    "enumerated region"
                );
                listing.reported_total += region_listing.reported_total;
                listing.instances.extend(region_listing.instances);
            }
            Err(err) => {
                warn!(
                    provider = %source.provider(),
                    account = %account.name,
                    region = %region,
                    error = %err,
                    "region enumeration failed"
                );
                listing.failed_regions.push(region.clone());
            }
        }
    }
    listing
}

/// Mask a credential for log output: first four characters only.
pub fn mask_key(key: &str) -> String {
    let prefix: String = key.chars().take(4).collect();
    format!("{prefix}****")
}
