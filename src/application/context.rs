use std::sync::Arc;

use anyhow::bail;
use anyhow::Result;

use crate::configuration::Config;
use crate::configuration::ConfigKey;
use crate::domain::models::ChatStore;
use crate::domain::models::RemoteSessionApi;
use crate::domain::services::SessionListStore;
use crate::domain::services::SessionSyncService;
use crate::infrastructure::cache::memory::InMemoryQueryCache;
use crate::infrastructure::remote::http::HttpSessionApi;
use crate::infrastructure::stores::yaml::YamlChatStore;

/// Long-lived collaborators built from the loaded configuration. The remote
/// side only exists when an `api-url` is configured.
pub struct AppContext {
    pub store: Arc<YamlChatStore>,
    pub remote: Option<Arc<HttpSessionApi>>,
    pub sync: Option<SessionSyncService>,
}

impl AppContext {
    pub fn from_config() -> AppContext {
        let store = Arc::new(YamlChatStore::default());
        let cache = Arc::new(InMemoryQueryCache::default());

        let remote = if Config::get(ConfigKey::ApiURL).is_empty() {
            None
        } else {
            Some(Arc::new(HttpSessionApi::default()))
        };

        let sync = remote.clone().map(|remote| {
            return SessionSyncService::new(
                remote,
                store.clone(),
                cache,
                SessionListStore::default(),
            );
        });

        return AppContext {
            store,
            remote,
            sync,
        };
    }

    pub fn store(&self) -> Arc<dyn ChatStore + Send + Sync> {
        return self.store.clone();
    }

    pub fn remote(&self) -> Option<Arc<dyn RemoteSessionApi + Send + Sync>> {
        return self
            .remote
            .clone()
            .map(|remote| return remote as Arc<dyn RemoteSessionApi + Send + Sync>);
    }

    pub fn require_sync(&self) -> Result<&SessionSyncService> {
        let Some(sync) = &self.sync else {
            bail!(format!(
                "No session service configured. Set `{}` in your config file or pass --{}.",
                ConfigKey::ApiURL,
                ConfigKey::ApiURL
            ));
        };

        return Ok(sync);
    }
}
