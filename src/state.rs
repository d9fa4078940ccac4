use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::blob::{BlobStore, FsBlobStore};
use crate::db::{HarvestDb, SharedDb};
use crate::error::PipelineError;
use crate::fetcher::{FetchSettings, ProfileFetcher};
use crate::notification::{notifier_from_config, Notifier};
use crate::profile_api::{ProfileApiClient, ProfileSource};
use crate::quota::QuotaManager;
use crate::scheduler::{parse_cron, parse_timezone, Scheduler};
use crate::types::Config;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "PROFILE_HARVESTER_CONFIG";

/// Environment variable overriding `profileApi.apiKey`.
pub const API_KEY_ENV: &str = "PROFILE_API_KEY";

/// Shared services wired from one [`Config`].
pub struct AppState {
    pub config: Config,
    pub db: SharedDb,
    pub notifier: Arc<dyn Notifier>,
    pub quota: Arc<QuotaManager>,
    pub fetcher: Arc<ProfileFetcher>,
}

impl AppState {
    /// Open the database and build the production collaborators.
    pub fn new(config: Config) -> Result<Self, PipelineError> {
        let db = HarvestDb::open_configured(config.database_path.as_deref())?.into_shared();
        let source: Arc<dyn ProfileSource> = Arc::new(ProfileApiClient::new(&config.profile_api)?);
        let blobs: Arc<dyn BlobStore> =
            Arc::new(FsBlobStore::from_config(config.blob.root_dir.as_deref())?);
        let notifier: Arc<dyn Notifier> = Arc::from(notifier_from_config(&config.notifications));

        if config.profile_api.api_key.is_empty() {
            log::warn!("No profile API key configured; every fetch will be rejected");
        }
        Self::with_collaborators(config, db, source, blobs, notifier)
    }

    pub fn with_collaborators(
        config: Config,
        db: SharedDb,
        source: Arc<dyn ProfileSource>,
        blobs: Arc<dyn BlobStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, PipelineError> {
        let settings = FetchSettings::from_config(&config)?;
        let quota = Arc::new(QuotaManager::new(
            db.clone(),
            notifier.clone(),
            config.quota.monthly_limit,
        ));
        let fetcher = Arc::new(ProfileFetcher::new(
            db.clone(),
            source,
            blobs,
            quota.clone(),
            notifier.clone(),
            settings,
        ));

        Ok(Self {
            config,
            db,
            notifier,
            quota,
            fetcher,
        })
    }

    pub fn scheduler(&self) -> Result<Scheduler, PipelineError> {
        let admin_email = Some(self.config.notifications.admin_email.clone())
            .filter(|email| !email.trim().is_empty());
        Scheduler::new(
            self.db.clone(),
            self.fetcher.clone(),
            self.quota.clone(),
            self.config.cron.clone(),
            admin_email,
        )
    }
}

/// Get the state directory (~/.profile-harvester)
pub fn state_dir() -> Result<PathBuf, PipelineError> {
    let home = dirs::home_dir().ok_or_else(|| {
        PipelineError::Configuration("Could not find home directory".to_string())
    })?;
    Ok(home.join(".profile-harvester"))
}

/// Resolve the config path: explicit argument, then `PROFILE_HARVESTER_CONFIG`,
/// then `~/.profile-harvester/config.json`.
pub fn config_path(explicit: Option<&Path>) -> Result<PathBuf, PipelineError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    Ok(state_dir()?.join("config.json"))
}

/// Load, override and validate the configuration.
///
/// A missing default config file yields the built-in defaults; a missing
/// file that was asked for explicitly is an error.
pub fn load_config(explicit: Option<&Path>) -> Result<Config, PipelineError> {
    let path = config_path(explicit)?;
    let requested = explicit.is_some() || std::env::var_os(CONFIG_ENV).is_some();

    let mut config = if path.exists() {
        read_config_file(&path)?
    } else if requested {
        return Err(PipelineError::Configuration(format!(
            "Config file not found at {}",
            path.display()
        )));
    } else {
        log::info!("No config at {}, using defaults", path.display());
        Config::default()
    };

    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    validate_config(&config)?;
    Ok(config)
}

pub fn read_config_file(path: &Path) -> Result<Config, PipelineError> {
    let content = fs::read_to_string(path).map_err(|e| {
        PipelineError::Configuration(format!("Failed to read config {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        PipelineError::Configuration(format!("Failed to parse config {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(key) = var(API_KEY_ENV).filter(|k| !k.trim().is_empty()) {
        config.profile_api.api_key = key;
    }
}

pub fn validate_config(config: &Config) -> Result<(), PipelineError> {
    let invalid = |msg: String| Err(PipelineError::Configuration(msg));

    if config.quota.monthly_limit <= 0 {
        return invalid(format!(
            "quota.monthlyLimit must be positive, got {}",
            config.quota.monthly_limit
        ));
    }
    if config.cron.batch_size <= 0 {
        return invalid(format!(
            "cron.batchSize must be positive, got {}",
            config.cron.batch_size
        ));
    }
    if config.profile_api.max_retries == 0 {
        return invalid("profileApi.maxRetries must be at least 1".to_string());
    }
    if config.profile_api.backoff_base_ms > config.profile_api.backoff_max_ms {
        return invalid(format!(
            "profileApi.backoffBaseMs ({}) exceeds backoffMaxMs ({})",
            config.profile_api.backoff_base_ms, config.profile_api.backoff_max_ms
        ));
    }
    parse_cron(&config.cron.profile_fetcher_schedule)?;
    parse_cron(&config.cron.quota_reset_schedule)?;
    parse_timezone(&config.cron.timezone)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::shared_test_db;
    use crate::test_support::{MemoryBlobStore, RecordingNotifier, ScriptedSource};

    fn write_config(json: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, json).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_explicit_config() {
        let (_dir, path) = write_config(
            r#"{
                "databasePath": "/tmp/harvester.db",
                "profileApi": { "maxRetries": 5, "interItemDelayMs": 0 },
                "quota": { "monthlyLimit": 1000 },
                "cron": { "batchSize": 25, "timezone": "Europe/Oslo" }
            }"#,
        );
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.database_path.as_deref(), Some("/tmp/harvester.db"));
        assert_eq!(config.profile_api.max_retries, 5);
        assert_eq!(config.profile_api.inter_item_delay_ms, 0);
        assert_eq!(config.quota.monthly_limit, 1000);
        assert_eq!(config.cron.batch_size, 25);
        assert_eq!(config.cron.profile_fetcher_schedule, "0 2 * * *");
    }

    #[test]
    fn test_missing_explicit_config_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("absent.json"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        for json in [
            r#"{ "quota": { "monthlyLimit": 0 } }"#,
            r#"{ "cron": { "batchSize": -1 } }"#,
            r#"{ "cron": { "profileFetcherSchedule": "soon" } }"#,
            r#"{ "cron": { "timezone": "Nowhere/Special" } }"#,
            r#"{ "profileApi": { "backoffBaseMs": 5000, "backoffMaxMs": 10 } }"#,
            r#"{ "quota": "#,
        ] {
            let (_dir, path) = write_config(json);
            assert!(
                matches!(load_config(Some(&path)), Err(PipelineError::Configuration(_))),
                "accepted {}",
                json
            );
        }
    }

    #[test]
    fn test_api_key_env_override() {
        let mut config = Config::default();
        config.profile_api.api_key = "from-file".into();

        apply_env_overrides(&mut config, |_| Some("  ".into()));
        assert_eq!(config.profile_api.api_key, "from-file");

        apply_env_overrides(&mut config, |name| {
            (name == API_KEY_ENV).then(|| "from-env".to_string())
        });
        assert_eq!(config.profile_api.api_key, "from-env");
    }

    #[tokio::test]
    async fn test_state_wires_scheduler() {
        let mut config = Config::default();
        config.notifications.admin_email = "ops@example.com".into();
        let state = AppState::with_collaborators(
            config,
            shared_test_db(),
            Arc::new(ScriptedSource::new()),
            Arc::new(MemoryBlobStore::default()),
            Arc::new(RecordingNotifier::default()),
        )
        .unwrap();
        assert_eq!(state.quota.current_status().unwrap().quota_limit, 50_000);

        let scheduler = state.scheduler().unwrap();
        assert_eq!(scheduler.start().unwrap(), 2);
        let row = state
            .db
            .lock()
            .get_cron_job(crate::types::QUOTA_RESET_JOB)
            .unwrap()
            .unwrap();
        assert_eq!(row.admin_email.as_deref(), Some("ops@example.com"));
        scheduler.stop().await;
    }
}
