use anyhow::Context;
use klapp_client::{HttpClientConfig, HttpKlappClient};
use klapp_config::{AppConfig, ConfigManager, ConfigOverrides};
use klapp_security::CredentialStore;
use klapp_sync::{EngineConfig, KlappEngine};
use std::path::Path;
use std::sync::Arc;

pub struct AppState {
    pub(crate) config_manager: ConfigManager,
    pub(crate) config: AppConfig,
    pub(crate) engine: KlappEngine,
}

impl AppState {
    pub fn initialize(config_dir: Option<&Path>, overrides: &ConfigOverrides) -> anyhow::Result<Self> {
        let config_manager = open_config(config_dir)?;
        let config = config_manager
            .load()
            .context("load app config")?
            .with_overrides(overrides);
        config.validate().context("validate command line overrides")?;

        let credentials = CredentialStore::default()
            .resolve(&config.account.email)
            .context("resolve KLAPP credentials")?;
        let client = HttpKlappClient::new(http_config_from(&config))
            .context("build KLAPP http client")?;
        let engine = KlappEngine::new(Arc::new(client), credentials, engine_config_from(&config));

        Ok(Self {
            config_manager,
            config,
            engine,
        })
    }
}

pub(crate) fn open_config(config_dir: Option<&Path>) -> anyhow::Result<ConfigManager> {
    match config_dir {
        Some(dir) => ConfigManager::in_dir(dir),
        None => ConfigManager::new(),
    }
    .context("initialize config manager")
}

pub(crate) fn engine_config_from(config: &AppConfig) -> EngineConfig {
    EngineConfig {
        poll_interval: config.poll_interval(),
        request_timeout: config.request_timeout(),
        backoff_cap_factor: config.sync.backoff_cap_factor,
        removal_grace_polls: config.sync.removal_grace_polls,
        max_write_attempts: config.sync.max_write_attempts,
        refresh_after_write: config.sync.refresh_after_write,
    }
}

pub(crate) fn http_config_from(config: &AppConfig) -> HttpClientConfig {
    HttpClientConfig {
        base_url: config.account.base_url.clone(),
        lookback_days: config.account.lookback_days,
        request_timeout: config.request_timeout(),
    }
}
