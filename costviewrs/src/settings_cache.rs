//! TTL-bounded cache of account default settings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};

use crate::config::SettingsCacheConfig;
use crate::error::{CostViewError, Result};

/// Settings category holding the cost view defaults.
pub const COST_SETTINGS_CATEGORY: &str = "CE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    pub identifier: String,
    pub value: String,
}

impl Setting {
    pub fn new(identifier: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            value: value.into(),
        }
    }
}

/// Source of account-level default settings.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn list_default_settings(&self, account_id: &str, category: &str)
        -> Result<Vec<Setting>>;
}

/// Identifier → value for one account.
pub type AccountSettings = Arc<HashMap<String, String>>;

/// Loading cache keyed by account id. Misses and expired entries are loaded
/// from the provider; concurrent misses for one account share a single load
/// and failed loads are not cached.
#[derive(Clone)]
pub struct SettingsCache {
    provider: Arc<dyn SettingsProvider>,
    cache: Cache<String, AccountSettings>,
}

impl SettingsCache {
    pub fn new(provider: Arc<dyn SettingsProvider>, config: &SettingsCacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_size)
            .time_to_live(Duration::from_secs(config.ttl_secs))
            .build();
        Self { provider, cache }
    }

    pub async fn get(&self, account_id: &str) -> Result<AccountSettings> {
        let provider = self.provider.clone();
        let account = account_id.to_string();
        self.cache
            .try_get_with(account_id.to_string(), async move {
                tracing::debug!(account_id = %account, "loading account settings");
                let settings = provider
                    .list_default_settings(&account, COST_SETTINGS_CATEGORY)
                    .await?;
                let map: HashMap<String, String> = settings
                    .into_iter()
                    .map(|s| (s.identifier.to_ascii_lowercase(), s.value))
                    .collect();
                Ok::<_, CostViewError>(Arc::new(map))
            })
            .await
            .map_err(|e| CostViewError::Execution(format!("load settings for {account_id}: {e}")))
    }

    pub async fn invalidate(&self, account_id: &str) {
        self.cache.invalidate(account_id).await;
    }
}
