use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://api.klapp.mobi";

/// Longest accepted poll interval and request timeout: one day.
pub const MAX_DURATION_SECS: u64 = 86_400;
/// Largest accepted backoff multiple of the poll interval.
pub const MAX_BACKOFF_CAP_FACTOR: u32 = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub version: u32,
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub email: String,
    pub base_url: String,
    /// How far back the unread query reaches.
    pub lookback_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    /// Upper bound for poll backoff, as a multiple of the poll interval.
    pub backoff_cap_factor: u32,
    /// Consecutive polls a message may be missing before it is dropped.
    pub removal_grace_polls: u32,
    pub max_write_attempts: u32,
    pub refresh_after_write: bool,
}

/// Values the host may force on top of the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub poll_interval_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            email: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            lookback_days: 3,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 300,
            request_timeout_secs: 10,
            backoff_cap_factor: 4,
            removal_grace_polls: 0,
            max_write_attempts: 3,
            refresh_after_write: true,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: 1,
            account: AccountConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn with_overrides(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(secs) = overrides.poll_interval_secs {
            self.sync.poll_interval_secs = secs;
        }
        if let Some(secs) = overrides.request_timeout_secs {
            self.sync.request_timeout_secs = secs;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync.poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.sync.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync.request_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.sync.poll_interval_secs > MAX_DURATION_SECS {
            return Err(ConfigError::Invalid(format!(
                "sync.poll_interval_secs must be at most {MAX_DURATION_SECS}"
            )));
        }
        if self.sync.request_timeout_secs > MAX_DURATION_SECS {
            return Err(ConfigError::Invalid(format!(
                "sync.request_timeout_secs must be at most {MAX_DURATION_SECS}"
            )));
        }
        if self.sync.backoff_cap_factor == 0 {
            return Err(ConfigError::Invalid(
                "sync.backoff_cap_factor must be at least 1".to_string(),
            ));
        }
        if self.sync.backoff_cap_factor > MAX_BACKOFF_CAP_FACTOR {
            return Err(ConfigError::Invalid(format!(
                "sync.backoff_cap_factor must be at most {MAX_BACKOFF_CAP_FACTOR}"
            )));
        }
        if self.sync.max_write_attempts == 0 {
            return Err(ConfigError::Invalid(
                "sync.max_write_attempts must be at least 1".to_string(),
            ));
        }

        let base_url = self.account.base_url.trim();
        if base_url.is_empty() {
            return Err(ConfigError::Invalid("account.base_url is required".to_string()));
        }
        let parsed = Url::parse(base_url)
            .map_err(|err| ConfigError::Invalid(format!("account.base_url: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(
                "account.base_url must use http or https".to_string(),
            ));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.sync.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_backend_cadence() {
        let config = AppConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(300));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.sync.backoff_cap_factor, 4);
        assert_eq!(config.account.lookback_days, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn overrides_replace_only_given_values() {
        let config = AppConfig::default().with_overrides(&ConfigOverrides {
            poll_interval_secs: Some(60),
            request_timeout_secs: None,
        });
        assert_eq!(config.sync.poll_interval_secs, 60);
        assert_eq!(config.sync.request_timeout_secs, 10);
    }

    #[test]
    fn rejects_zero_interval_and_bad_url() {
        let mut config = AppConfig::default();
        config.sync.poll_interval_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AppConfig::default();
        config.account.base_url = "ftp://api.klapp.mobi".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_intervals_longer_than_a_day() {
        for secs in [MAX_DURATION_SECS + 1, u64::MAX] {
            let config = AppConfig::default().with_overrides(&ConfigOverrides {
                poll_interval_secs: Some(secs),
                request_timeout_secs: None,
            });
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

            let config = AppConfig::default().with_overrides(&ConfigOverrides {
                poll_interval_secs: None,
                request_timeout_secs: Some(secs),
            });
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }

        let mut config = AppConfig::default();
        config.sync.backoff_cap_factor = u32::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AppConfig::default();
        config.sync.poll_interval_secs = MAX_DURATION_SECS;
        config.sync.request_timeout_secs = MAX_DURATION_SECS;
        config.sync.backoff_cap_factor = MAX_BACKOFF_CAP_FACTOR;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config: AppConfig = toml::from_str("version = 1\n").expect("config parsed");
        assert_eq!(config.sync.poll_interval_secs, 300);
        assert_eq!(config.account.base_url, DEFAULT_BASE_URL);
    }
}
