//! Environment-driven configuration.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hrsync_adapters::{EmploymentAlignment, FlattenConfig, GraphConfig, MAX_PAGE_SIZE};
use hrsync_storage::{BackoffPolicy, HttpClientConfig, RetryPolicy};
use thiserror::Error;

pub const DEFAULT_DATABASE_URL: &str = "postgres://localhost/greenhouse_candidates";
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_GREENHOUSE_BASE_URL: &str = "https://harvest.greenhouse.io/v1";
pub const DEFAULT_INITIAL_SINCE: &str = "2020-01-01T00:00:00Z";
pub const DEFAULT_SYNC_OVERLAP_SECS: u64 = 120;
pub const MAX_SYNC_OVERLAP_SECS: u64 = 7 * 24 * 60 * 60;
pub const DEFAULT_PAGE_DELAY_MS: u64 = 200;
pub const DEFAULT_RESUME_CONTENT_FIELD_ID: &str = "11138961008";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_RESUME_FOLDER_PATH: &str = "Greenhouse/Greenhouse_Resumes";
pub const DEFAULT_AI_ACCESS_FOLDER: &str = "AI_Access";
pub const DEFAULT_SYNC_CRON: &str = "0 0 6 * * *";
pub const DEFAULT_DOWNLOAD_MAX_AGE_HOURS: u64 = 24;
pub const DEFAULT_DOWNLOAD_CALL_DELAY_MS: u64 = 100;

const USER_AGENT: &str = concat!("hrsync/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub greenhouse_api_key: Option<String>,
    pub greenhouse_base_url: String,
    pub page_size: u32,
    pub initial_since: DateTime<Utc>,
    pub sync_overlap: Duration,
    pub page_delay: Duration,
    pub resume_content_field_id: String,
    pub employment_alignment: EmploymentAlignment,
    pub http_timeout: Duration,
    pub retry_max_backoff_attempts: usize,
    pub retry_max_connection_attempts: usize,
    pub batch_size: usize,
    pub map_call_delay: Duration,
    pub skip_if_already_mapped: bool,
    /// Only download for candidates updated this recently; attachment URLs
    /// are signed and expire. `None` downloads regardless of age.
    pub download_max_age: Option<Duration>,
    pub download_call_delay: Duration,
    pub prefer_pdf: bool,
    pub skip_if_already_downloaded: bool,
    pub local_resume_dir: Option<PathBuf>,
    pub ai_access_dir: Option<PathBuf>,
    pub azure_tenant_id: Option<String>,
    pub azure_client_id: Option<String>,
    pub azure_client_secret: Option<String>,
    pub sharepoint_site_id: Option<String>,
    pub resume_folder_path: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

fn parse_var<T: FromStr>(
    key: &'static str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
            key,
            reason: err.to_string(),
            value,
        }),
    }
}

fn parse_flag(key: &'static str, raw: Option<String>, default: bool) -> Result<bool, ConfigError> {
    match raw.as_deref().map(str::trim) {
        None => Ok(default),
        Some(v) if matches!(v, "1" | "true" | "TRUE" | "True" | "yes") => Ok(true),
        Some(v) if matches!(v, "0" | "false" | "FALSE" | "False" | "no") => Ok(false),
        Some(v) => Err(ConfigError::Invalid {
            key,
            value: v.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl SyncConfig {
    /// Load `.env` (if present) and then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup, then validate.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| non_empty(lookup(key));

        let initial_since_raw =
            get("INITIAL_SINCE").unwrap_or_else(|| DEFAULT_INITIAL_SINCE.to_string());
        let initial_since = DateTime::parse_from_rfc3339(&initial_since_raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|err| ConfigError::Invalid {
                key: "INITIAL_SINCE",
                value: initial_since_raw.clone(),
                reason: err.to_string(),
            })?;

        let page_size: u32 = parse_var("PAGE_SIZE", get("PAGE_SIZE"), MAX_PAGE_SIZE)?;

        let config = Self {
            database_url: get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            database_max_connections: parse_var(
                "DATABASE_MAX_CONNECTIONS",
                get("DATABASE_MAX_CONNECTIONS"),
                DEFAULT_DATABASE_MAX_CONNECTIONS,
            )?,
            greenhouse_api_key: get("GREENHOUSE_API_KEY"),
            greenhouse_base_url: get("GREENHOUSE_BASE_URL")
                .unwrap_or_else(|| DEFAULT_GREENHOUSE_BASE_URL.to_string()),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
            initial_since,
            sync_overlap: Duration::from_secs(parse_var(
                "SYNC_OVERLAP_SECS",
                get("SYNC_OVERLAP_SECS"),
                DEFAULT_SYNC_OVERLAP_SECS,
            )?),
            page_delay: Duration::from_millis(parse_var(
                "PAGE_DELAY_MS",
                get("PAGE_DELAY_MS"),
                DEFAULT_PAGE_DELAY_MS,
            )?),
            resume_content_field_id: get("RESUME_CONTENT_FIELD_ID")
                .unwrap_or_else(|| DEFAULT_RESUME_CONTENT_FIELD_ID.to_string()),
            employment_alignment: match get("EMPLOYMENT_ALIGNMENT") {
                None => EmploymentAlignment::default(),
                Some(value) => value.parse().map_err(|reason| ConfigError::Invalid {
                    key: "EMPLOYMENT_ALIGNMENT",
                    value,
                    reason,
                })?,
            },
            http_timeout: Duration::from_secs(parse_var(
                "HTTP_TIMEOUT_SECS",
                get("HTTP_TIMEOUT_SECS"),
                DEFAULT_HTTP_TIMEOUT_SECS,
            )?),
            retry_max_backoff_attempts: parse_var(
                "RETRY_MAX_BACKOFF_ATTEMPTS",
                get("RETRY_MAX_BACKOFF_ATTEMPTS"),
                BackoffPolicy::default().max_retries,
            )?,
            retry_max_connection_attempts: parse_var(
                "RETRY_MAX_CONNECTION_ATTEMPTS",
                get("RETRY_MAX_CONNECTION_ATTEMPTS"),
                RetryPolicy::default().connection_retries,
            )?,
            batch_size: parse_var("BATCH_SIZE", get("BATCH_SIZE"), DEFAULT_BATCH_SIZE)?,
            map_call_delay: Duration::from_millis(parse_var(
                "MAP_CALL_DELAY_MS",
                get("MAP_CALL_DELAY_MS"),
                0u64,
            )?),
            skip_if_already_mapped: parse_flag(
                "SKIP_IF_ALREADY_MAPPED",
                get("SKIP_IF_ALREADY_MAPPED"),
                true,
            )?,
            download_max_age: match parse_var(
                "DOWNLOAD_MAX_AGE_HOURS",
                get("DOWNLOAD_MAX_AGE_HOURS"),
                DEFAULT_DOWNLOAD_MAX_AGE_HOURS,
            )? {
                0 => None,
                hours => Some(Duration::from_secs(hours.saturating_mul(3600))),
            },
            download_call_delay: Duration::from_millis(parse_var(
                "DOWNLOAD_CALL_DELAY_MS",
                get("DOWNLOAD_CALL_DELAY_MS"),
                DEFAULT_DOWNLOAD_CALL_DELAY_MS,
            )?),
            prefer_pdf: parse_flag("PREFER_PDF_FORMAT", get("PREFER_PDF_FORMAT"), true)?,
            skip_if_already_downloaded: parse_flag(
                "SKIP_IF_ALREADY_DOWNLOADED",
                get("SKIP_IF_ALREADY_DOWNLOADED"),
                true,
            )?,
            local_resume_dir: get("LOCAL_RESUME_DIR").map(PathBuf::from),
            ai_access_dir: get("AI_ACCESS_DIR").map(PathBuf::from),
            azure_tenant_id: get("AZURE_TENANT_ID"),
            azure_client_id: get("AZURE_CLIENT_ID"),
            azure_client_secret: get("AZURE_CLIENT_SECRET"),
            sharepoint_site_id: get("SHAREPOINT_SITE_ID"),
            resume_folder_path: get("RESUME_FOLDER_PATH")
                .unwrap_or_else(|| DEFAULT_RESUME_FOLDER_PATH.to_string()),
            scheduler_enabled: parse_flag(
                "HRSYNC_SCHEDULER_ENABLED",
                get("HRSYNC_SCHEDULER_ENABLED"),
                false,
            )?,
            sync_cron: get("SYNC_CRON").unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }
        if self.database_max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "DATABASE_MAX_CONNECTIONS",
                value: "0".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.sync_overlap > Duration::from_secs(MAX_SYNC_OVERLAP_SECS) {
            return Err(ConfigError::Invalid {
                key: "SYNC_OVERLAP_SECS",
                value: self.sync_overlap.as_secs().to_string(),
                reason: format!("must be at most {MAX_SYNC_OVERLAP_SECS}"),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "BATCH_SIZE",
                value: "0".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.sync_cron.split_whitespace().count() < 6 {
            return Err(ConfigError::Invalid {
                key: "SYNC_CRON",
                value: self.sync_cron.clone(),
                reason: "expected a six-field cron expression with seconds".into(),
            });
        }
        Ok(())
    }

    /// API key for the Harvest source.
    pub fn require_source(&self) -> Result<&str, ConfigError> {
        self.greenhouse_api_key
            .as_deref()
            .ok_or(ConfigError::Missing("GREENHOUSE_API_KEY"))
    }

    /// Resume root for the mapping stages.
    pub fn require_mapping(&self) -> Result<&Path, ConfigError> {
        self.local_resume_dir
            .as_deref()
            .ok_or(ConfigError::Missing("LOCAL_RESUME_DIR"))
    }

    pub fn require_resolver(&self) -> Result<GraphConfig, ConfigError> {
        fn need<'a>(value: &'a Option<String>, key: &'static str) -> Result<&'a str, ConfigError> {
            value.as_deref().ok_or(ConfigError::Missing(key))
        }
        Ok(GraphConfig {
            tenant_id: need(&self.azure_tenant_id, "AZURE_TENANT_ID")?.to_string(),
            client_id: need(&self.azure_client_id, "AZURE_CLIENT_ID")?.to_string(),
            client_secret: need(&self.azure_client_secret, "AZURE_CLIENT_SECRET")?.to_string(),
            site_id: need(&self.sharepoint_site_id, "SHAREPOINT_SITE_ID")?.to_string(),
            folder_path: self.resume_folder_path.clone(),
            login_base_url: GraphConfig::LOGIN_BASE_URL.to_string(),
            graph_base_url: GraphConfig::GRAPH_BASE_URL.to_string(),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            backoff: BackoffPolicy {
                max_retries: self.retry_max_backoff_attempts,
                ..defaults.backoff
            },
            connection_retries: self.retry_max_connection_attempts,
            ..defaults
        }
    }

    pub fn http_client_config(&self, basic_auth_user: Option<String>) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: Some(USER_AGENT.to_string()),
            basic_auth_user,
            retry: self.retry_policy(),
        }
    }

    pub fn flatten_config(&self) -> FlattenConfig {
        FlattenConfig {
            resume_content_field_id: self.resume_content_field_id.clone(),
            employment_alignment: self.employment_alignment,
        }
    }

    /// Flat AI-access directory: explicit setting, else `AI_Access` under the
    /// resume root.
    pub fn resolved_ai_access_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.ai_access_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(self.require_mapping()?.join(DEFAULT_AI_ACCESS_FOLDER)),
        }
    }

    /// Remote path prefix of the AI-access directory relative to the resume
    /// folder.
    pub fn ai_remote_prefix(&self) -> Result<String, ConfigError> {
        let ai_dir = self.resolved_ai_access_dir()?;
        let resume_dir = self.require_mapping()?;
        let relative = match ai_dir.strip_prefix(resume_dir) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => ai_dir
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_AI_ACCESS_FOLDER)),
        };
        Ok(relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<SyncConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SyncConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).expect("config");
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.page_size, 500);
        assert_eq!(config.initial_since.to_rfc3339(), "2020-01-01T00:00:00+00:00");
        assert_eq!(config.sync_overlap, Duration::from_secs(120));
        assert_eq!(config.page_delay, Duration::from_millis(200));
        assert_eq!(config.employment_alignment, EmploymentAlignment::Padded);
        assert_eq!(config.batch_size, 100);
        assert!(config.skip_if_already_mapped);
        assert!(!config.scheduler_enabled);
        assert_eq!(config.retry_policy().backoff.max_retries, 6);
        assert_eq!(config.retry_policy().connection_retries, 3);
    }

    #[test]
    fn page_size_is_clamped() {
        assert_eq!(config_from(&[("PAGE_SIZE", "9000")]).expect("config").page_size, 500);
        assert_eq!(config_from(&[("PAGE_SIZE", "0")]).expect("config").page_size, 1);
    }

    #[test]
    fn invalid_values_are_fatal() {
        assert!(matches!(
            config_from(&[("INITIAL_SINCE", "yesterday")]),
            Err(ConfigError::Invalid { key: "INITIAL_SINCE", .. })
        ));
        assert!(matches!(
            config_from(&[("EMPLOYMENT_ALIGNMENT", "zipped")]),
            Err(ConfigError::Invalid { key: "EMPLOYMENT_ALIGNMENT", .. })
        ));
        assert!(matches!(
            config_from(&[("BATCH_SIZE", "0")]),
            Err(ConfigError::Invalid { key: "BATCH_SIZE", .. })
        ));
        assert!(matches!(
            config_from(&[("SKIP_IF_ALREADY_MAPPED", "maybe")]),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn sync_overlap_is_bounded() {
        assert!(config_from(&[("SYNC_OVERLAP_SECS", "604800")]).is_ok());
        assert!(matches!(
            config_from(&[("SYNC_OVERLAP_SECS", "604801")]),
            Err(ConfigError::Invalid { key: "SYNC_OVERLAP_SECS", .. })
        ));
        assert!(matches!(
            config_from(&[("SYNC_OVERLAP_SECS", "18446744073709551615")]),
            Err(ConfigError::Invalid { key: "SYNC_OVERLAP_SECS", .. })
        ));
    }

    #[test]
    fn download_settings() {
        let config = config_from(&[]).expect("config");
        assert_eq!(config.download_max_age, Some(Duration::from_secs(24 * 3600)));
        assert_eq!(config.download_call_delay, Duration::from_millis(100));
        assert!(config.prefer_pdf);
        assert!(config.skip_if_already_downloaded);

        let config = config_from(&[
            ("DOWNLOAD_MAX_AGE_HOURS", "0"),
            ("PREFER_PDF_FORMAT", "false"),
        ])
        .expect("config");
        assert_eq!(config.download_max_age, None);
        assert!(!config.prefer_pdf);
    }

    #[test]
    fn stage_requirements_are_checked() {
        let config = config_from(&[]).expect("config");
        assert!(matches!(config.require_source(), Err(ConfigError::Missing("GREENHOUSE_API_KEY"))));
        assert!(matches!(config.require_mapping(), Err(ConfigError::Missing("LOCAL_RESUME_DIR"))));
        assert!(matches!(config.require_resolver(), Err(ConfigError::Missing("AZURE_TENANT_ID"))));

        let config = config_from(&[
            ("GREENHOUSE_API_KEY", "k"),
            ("LOCAL_RESUME_DIR", "/data/resumes"),
            ("AZURE_TENANT_ID", "t"),
            ("AZURE_CLIENT_ID", "c"),
            ("AZURE_CLIENT_SECRET", "s"),
            ("SHAREPOINT_SITE_ID", "site"),
        ])
        .expect("config");
        assert_eq!(config.require_source().expect("source"), "k");
        assert_eq!(config.require_resolver().expect("resolver").site_id, "site");
        assert_eq!(
            config.resolved_ai_access_dir().expect("ai dir"),
            PathBuf::from("/data/resumes/AI_Access")
        );
        assert_eq!(config.ai_remote_prefix().expect("prefix"), "AI_Access");
    }

    #[test]
    fn ai_dir_outside_resume_root_uses_its_name() {
        let config = config_from(&[
            ("LOCAL_RESUME_DIR", "/data/resumes"),
            ("AI_ACCESS_DIR", "/mnt/flat/AI_Copy"),
        ])
        .expect("config");
        assert_eq!(config.ai_remote_prefix().expect("prefix"), "AI_Copy");
    }
}
