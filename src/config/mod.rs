use crate::error::AuthError;
use crate::filter::{FilterSet, TypeFilter};
use crate::scraper::http_client::RetryPolicy;
use crate::scraper::session::Credentials;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub portal: PortalConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub trend: TrendConfig,
}

/// Portal endpoints and HTTP behaviour
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortalConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_login_path")]
    pub login_path: String,

    #[serde(default = "default_list_path")]
    pub list_path: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,

    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Clone, Default, Deserialize, Serialize)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Crawl behaviour: retries, pagination and detail enrichment
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FetchConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    #[serde(default = "default_detail_timeout_secs")]
    pub detail_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub fetch_closing_dates: bool,
}

/// Which listings to report
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FilterConfig {
    #[serde(default, rename = "type")]
    pub housing_type: TypeFilter,

    #[serde(default)]
    pub max_rent: Option<u32>,

    #[serde(default)]
    pub area: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrendConfig {
    #[serde(default = "default_window_days")]
    pub window_days: u32,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_base_url() -> String {
    "https://sssb.se".to_string()
}
fn default_login_path() -> String {
    "/mina-sidor/logga-in/".to_string()
}
fn default_list_path() -> String {
    "/soka-bostad/sok-ledigt/lediga-bostader/".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_request_delay_ms() -> u64 {
    800
}
fn default_jitter_ms() -> u64 {
    400
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/124.0.0.0 Safari/537.36"
        .to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_initial_ms() -> u64 {
    1000
}
fn default_concurrency() -> usize {
    3
}
fn default_max_pages() -> u32 {
    10
}
fn default_page_size() -> u32 {
    100
}
fn default_detail_timeout_secs() -> u64 {
    180
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/sssb.duckdb")
}
fn default_window_days() -> u32 {
    7
}
fn default_true() -> bool {
    true
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            login_path: default_login_path(),
            list_path: default_list_path(),
            timeout_secs: default_timeout_secs(),
            request_delay_ms: default_request_delay_ms(),
            jitter_ms: default_jitter_ms(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_initial_ms: default_backoff_initial_ms(),
            concurrency: default_concurrency(),
            max_pages: default_max_pages(),
            page_size: default_page_size(),
            detail_timeout_secs: default_detail_timeout_secs(),
            fetch_closing_dates: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            run_migrations: true,
        }
    }
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
        }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::Environment::with_prefix("SSSB")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        cfg.try_deserialize().context("Invalid configuration")
    }

    pub fn credentials(&self) -> std::result::Result<Credentials, AuthError> {
        match (&self.credentials.username, &self.credentials.password) {
            (Some(u), Some(p)) if !u.is_empty() => Ok(Credentials::new(u.clone(), p.clone())),
            _ => Err(AuthError::MissingCredentials),
        }
    }

    pub fn filter_set(&self) -> FilterSet {
        FilterSet {
            housing_type: self.filter.housing_type,
            max_rent: self.filter.max_rent,
            area: self.filter.area.clone(),
        }
    }
}

impl FetchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.backoff_initial_ms),
        }
    }

    pub fn detail_timeout(&self) -> Duration {
        Duration::from_secs(self.detail_timeout_secs)
    }
}

impl PortalConfig {
    pub fn login_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.login_path)
    }

    pub fn list_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.list_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_portal_conventions() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.fetch.max_retries, 3);
        assert_eq!(cfg.fetch.retry_policy().delays(), vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
        ]);
        assert!(cfg.fetch.fetch_closing_dates);
        assert_eq!(cfg.trend.window_days, 7);
        assert_eq!(cfg.portal.login_url(), "https://sssb.se/mina-sidor/logga-in/");
    }

    #[test]
    fn missing_credentials_is_an_auth_error() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.credentials().unwrap_err(), AuthError::MissingCredentials);
    }

    #[test]
    fn password_is_not_logged() {
        let creds = CredentialsConfig {
            username: Some("student".into()),
            password: Some("hunter2".into()),
        };
        let shown = format!("{:?}", creds);
        assert!(shown.contains("student"));
        assert!(!shown.contains("hunter2"));
    }
}
