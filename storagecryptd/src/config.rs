use std::path::{Path, PathBuf};
use std::time::Duration;

use storagecrypt_core::{AppCredentials, StorageType, SwiftConfig};
use thiserror::Error;

use crate::backoff::RateLimitPolicy;

const DATA_DIR_NAME: &str = "storagecrypt";
const DATABASE_FILE: &str = "index.db";
const DEFAULT_CHANGES_POLL_SECS: u64 = 300;
const DEFAULT_WORKERS: u64 = 2;
const DEFAULT_KEY_ALIAS: &str = "default";
const DEFAULT_RATE_LIMIT_INITIAL_MS: u64 = 10_000;
const DEFAULT_RATE_LIMIT_MAX_MS: u64 = 600_000;
const DEFAULT_MAX_SYNC_FAILURES: u64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("home directory is unavailable")]
    MissingHome,
    #[error("{0} is set but {1} is missing")]
    Incomplete(String, String),
}

#[derive(Debug, Clone, Default)]
pub struct ProviderKeys {
    pub drive: Option<AppCredentials>,
    pub disk: Option<AppCredentials>,
    pub swift: Option<(SwiftConfig, AppCredentials)>,
}

impl ProviderKeys {
    pub fn has(&self, storage_type: StorageType) -> bool {
        match storage_type {
            StorageType::Drive => self.drive.is_some(),
            StorageType::Disk => self.disk.is_some(),
            StorageType::Swift => self.swift.is_some(),
            StorageType::Unsynchronized => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub changes_poll_interval: Duration,
    pub workers: usize,
    pub key_alias: String,
    pub rate_limit: RateLimitPolicy,
    pub max_sync_failures: i64,
    pub providers: ProviderKeys,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::MissingHome)?;
        Self::from_lookup(|name| std::env::var(name).ok(), &home)
    }

    pub fn from_lookup<F>(lookup: F, home: &Path) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = lookup("STORAGECRYPT_DATA_DIR")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| default_data_dir(home));
        let database_path = lookup("STORAGECRYPT_DATABASE")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| data_dir.join(DATABASE_FILE));
        let changes_poll_interval = Duration::from_secs(read_u64(
            &lookup,
            "STORAGECRYPT_CHANGES_POLL_SECS",
            DEFAULT_CHANGES_POLL_SECS,
        ));
        let workers = read_u64(&lookup, "STORAGECRYPT_WORKERS", DEFAULT_WORKERS) as usize;
        let key_alias = lookup("STORAGECRYPT_KEY_ALIAS")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_KEY_ALIAS.to_string());
        let rate_limit = RateLimitPolicy {
            initial_ms: read_u64(
                &lookup,
                "STORAGECRYPT_RATE_LIMIT_INITIAL_MS",
                DEFAULT_RATE_LIMIT_INITIAL_MS,
            ) as i64,
            max_ms: read_u64(
                &lookup,
                "STORAGECRYPT_RATE_LIMIT_MAX_MS",
                DEFAULT_RATE_LIMIT_MAX_MS,
            ) as i64,
        };
        let max_sync_failures = read_u64(
            &lookup,
            "STORAGECRYPT_MAX_SYNC_FAILURES",
            DEFAULT_MAX_SYNC_FAILURES,
        ) as i64;

        let swift = match app_credentials(&lookup, "SWIFT")? {
            Some(credentials) => {
                let endpoint = require(&lookup, "STORAGECRYPT_SWIFT_CLIENT_ID", "STORAGECRYPT_SWIFT_ENDPOINT")?;
                let container = require(&lookup, "STORAGECRYPT_SWIFT_CLIENT_ID", "STORAGECRYPT_SWIFT_CONTAINER")?;
                let oauth_base = require(&lookup, "STORAGECRYPT_SWIFT_CLIENT_ID", "STORAGECRYPT_SWIFT_OAUTH_URL")?;
                Some((
                    SwiftConfig {
                        endpoint,
                        container,
                        oauth_base,
                    },
                    credentials,
                ))
            }
            None => None,
        };
        let providers = ProviderKeys {
            drive: app_credentials(&lookup, "DRIVE")?,
            disk: app_credentials(&lookup, "DISK")?,
            swift,
        };

        Ok(Self {
            data_dir,
            database_path,
            changes_poll_interval,
            workers,
            key_alias,
            rate_limit,
            max_sync_failures,
            providers,
        })
    }
}

/// Reads `STORAGECRYPT_<PROVIDER>_*`; a provider without a client id is
/// simply not configured.
fn app_credentials<F>(lookup: &F, provider: &str) -> Result<Option<AppCredentials>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let id_var = format!("STORAGECRYPT_{provider}_CLIENT_ID");
    let Some(client_id) = lookup(&id_var).filter(|value| !value.trim().is_empty()) else {
        return Ok(None);
    };
    let client_secret = require(lookup, &id_var, &format!("STORAGECRYPT_{provider}_CLIENT_SECRET"))?;
    let redirect_uri = require(lookup, &id_var, &format!("STORAGECRYPT_{provider}_REDIRECT_URI"))?;
    let scope = lookup(&format!("STORAGECRYPT_{provider}_SCOPE")).filter(|v| !v.trim().is_empty());
    Ok(Some(AppCredentials {
        client_id,
        client_secret,
        redirect_uri,
        scope,
    }))
}

fn require<F>(lookup: &F, set: &str, name: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ConfigError::Incomplete(set.to_string(), name.to_string()))
}

pub(crate) fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_data_dir(home: &Path) -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| home.join(".local/share"))
        .join(DATA_DIR_NAME)
}

fn read_u64<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<DaemonConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DaemonConfig::from_lookup(|name| vars.get(name).cloned(), Path::new("/home/me"))
    }

    #[test]
    fn expands_tilde_paths() {
        let home = Path::new("/home/me");
        assert_eq!(expand_with_home("~", home), PathBuf::from("/home/me"));
        assert_eq!(
            expand_with_home("~/vault", home),
            PathBuf::from("/home/me/vault")
        );
        assert_eq!(expand_with_home("/srv/x", home), PathBuf::from("/srv/x"));
    }

    #[test]
    fn defaults_apply_without_variables() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.changes_poll_interval, Duration::from_secs(300));
        assert_eq!(config.workers, 2);
        assert_eq!(config.key_alias, "default");
        assert_eq!(config.rate_limit, RateLimitPolicy::default());
        assert_eq!(config.max_sync_failures, 10);
        assert!(config.database_path.ends_with("storagecrypt/index.db"));
        assert!(!config.providers.has(StorageType::Drive));
    }

    #[test]
    fn data_dir_drives_database_default() {
        let config = config_from(&[("STORAGECRYPT_DATA_DIR", "~/vault"), ("STORAGECRYPT_WORKERS", "0")]).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/home/me/vault"));
        assert_eq!(config.database_path, PathBuf::from("/home/me/vault/index.db"));
        assert_eq!(config.workers, 2);
    }

    #[test]
    fn provider_keys_are_read_per_provider() {
        let config = config_from(&[
            ("STORAGECRYPT_DRIVE_CLIENT_ID", "id"),
            ("STORAGECRYPT_DRIVE_CLIENT_SECRET", "secret"),
            ("STORAGECRYPT_DRIVE_REDIRECT_URI", "http://localhost/cb"),
        ])
        .unwrap();
        let drive = config.providers.drive.unwrap();
        assert_eq!(drive.client_id, "id");
        assert!(config.providers.disk.is_none());
    }

    #[test]
    fn partial_provider_keys_are_rejected() {
        let err = config_from(&[("STORAGECRYPT_DISK_CLIENT_ID", "id")]).unwrap_err();
        assert!(matches!(err, ConfigError::Incomplete(_, name) if name == "STORAGECRYPT_DISK_CLIENT_SECRET"));
    }
}
