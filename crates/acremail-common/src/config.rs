//! Configuration for acremail

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file locations, first match wins
const CONFIG_PATHS: &[&str] = &["./acremail.toml", "/etc/acremail/acremail.toml"];

/// Environment variable prefix, e.g. `ACREMAIL__EMAIL__SENDGRID_API_KEY`
const ENV_PREFIX: &str = "ACREMAIL";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Outbound email provider configuration
    #[serde(default)]
    pub email: EmailConfig,

    /// Open/click tracking and unsubscribe links
    #[serde(default)]
    pub tracking: TrackingConfig,

    /// Job queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Recurring task configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            bind_address: default_bind_address(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API port
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// CORS allowed origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_api_port() -> u16 {
    8080
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level, used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info,acremail=debug".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Outbound email provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Provider: "sendgrid" or "log"
    #[serde(default = "default_email_provider")]
    pub provider: String,

    /// SendGrid API key
    pub sendgrid_api_key: Option<String>,

    /// SendGrid API base URL
    #[serde(default = "default_sendgrid_api_url")]
    pub sendgrid_api_url: String,

    /// SendGrid unsubscribe group (ASM) id
    #[serde(default = "default_unsubscribe_group_id")]
    pub unsubscribe_group_id: i64,

    /// Default sender name
    #[serde(default = "default_from_name")]
    pub from_name: String,

    /// Default sender address
    #[serde(default = "default_from_email")]
    pub from_email: String,

    /// Default reply-to address
    pub reply_to: Option<String>,

    /// Address shown to buyers for help, e.g. in welcome emails
    #[serde(default = "default_support_email")]
    pub support_email: String,

    /// Pause between two consecutive sends in milliseconds
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,

    /// Provider request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            provider: default_email_provider(),
            sendgrid_api_key: None,
            sendgrid_api_url: default_sendgrid_api_url(),
            unsubscribe_group_id: default_unsubscribe_group_id(),
            from_name: default_from_name(),
            from_email: default_from_email(),
            reply_to: None,
            support_email: default_support_email(),
            pacing_ms: default_pacing_ms(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl EmailConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

fn default_email_provider() -> String {
    "sendgrid".to_string()
}

fn default_sendgrid_api_url() -> String {
    "https://api.sendgrid.com/v3".to_string()
}

fn default_unsubscribe_group_id() -> i64 {
    1
}

fn default_from_name() -> String {
    "Landivo".to_string()
}

fn default_from_email() -> String {
    "noreply@landivo.com".to_string()
}

fn default_support_email() -> String {
    "support@landivo.com".to_string()
}

fn default_pacing_ms() -> u64 {
    100
}

fn default_request_timeout() -> u64 {
    30
}

/// Tracking and unsubscribe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Public base URL of the tracking endpoints
    #[serde(default = "default_tracking_base_url")]
    pub base_url: String,

    /// Public site URL: default click redirect and property links
    #[serde(default = "default_frontend_url")]
    pub frontend_url: String,

    /// Secret used to sign unsubscribe tokens
    pub unsubscribe_secret: Option<String>,

    /// Window in which repeated opens are collapsed into one
    #[serde(default = "default_open_dedup_window")]
    pub open_dedup_window_secs: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            base_url: default_tracking_base_url(),
            frontend_url: default_frontend_url(),
            unsubscribe_secret: None,
            open_dedup_window_secs: default_open_dedup_window(),
        }
    }
}

fn default_tracking_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_frontend_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_open_dedup_window() -> u64 {
    3600
}

/// Job queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Attempts before a job is terminally failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    /// First retry delay; doubles on each further attempt
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Recipients per delivery batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pause between campaign batches
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,

    /// Extra start delay per bulk batch index
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,

    /// Completed jobs kept after trimming
    #[serde(default = "default_keep_completed")]
    pub keep_completed: i64,

    /// Failed jobs kept after trimming
    #[serde(default = "default_keep_failed")]
    pub keep_failed: i64,

    /// Finished jobs older than this are removed regardless of count
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i64,

    /// Worker poll interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Jobs executed concurrently per poll
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// A `processing` job whose worker has been silent this long is
    /// treated as abandoned and handed out again
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            stagger_ms: default_stagger_ms(),
            keep_completed: default_keep_completed(),
            keep_failed: default_keep_failed(),
            retention_hours: default_retention_hours(),
            poll_interval_ms: default_poll_interval_ms(),
            concurrency: default_concurrency(),
            stall_timeout_secs: default_stall_timeout_secs(),
        }
    }
}

impl QueueConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

fn default_max_attempts() -> i32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    2000
}

fn default_batch_size() -> usize {
    50
}

fn default_batch_delay_ms() -> u64 {
    2000
}

fn default_stagger_ms() -> u64 {
    1000
}

fn default_keep_completed() -> i64 {
    100
}

fn default_keep_failed() -> i64 {
    50
}

fn default_retention_hours() -> i64 {
    24
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_concurrency() -> usize {
    4
}

fn default_stall_timeout_secs() -> u64 {
    600
}

/// Recurring task configuration. Cron expressions use the six-field
/// form with a leading seconds column and are evaluated in UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Enable recurring tasks
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,

    #[serde(default = "default_scheduled_campaigns_cron")]
    pub scheduled_campaigns_cron: String,

    #[serde(default = "default_automation_triggers_cron")]
    pub automation_triggers_cron: String,

    #[serde(default = "default_cleanup_cron")]
    pub cleanup_cron: String,

    #[serde(default = "default_daily_summary_cron")]
    pub daily_summary_cron: String,

    #[serde(default = "default_reengagement_cron")]
    pub reengagement_cron: String,

    /// Look-back window for new buyers and properties
    #[serde(default = "default_trigger_window_minutes")]
    pub trigger_window_minutes: i64,

    #[serde(default = "default_tracking_retention_months")]
    pub tracking_retention_months: u32,

    #[serde(default = "default_execution_retention_months")]
    pub execution_retention_months: u32,

    /// Buyers selected per re-engagement run
    #[serde(default = "default_reengagement_limit")]
    pub reengagement_limit: i64,

    /// Inactivity threshold when a rule does not set one
    #[serde(default = "default_inactivity_days")]
    pub inactivity_days: i64,

    /// Minimum gap since the last email before a buyer is re-selected
    #[serde(default = "default_email_cooldown_days")]
    pub email_cooldown_days: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            scheduled_campaigns_cron: default_scheduled_campaigns_cron(),
            automation_triggers_cron: default_automation_triggers_cron(),
            cleanup_cron: default_cleanup_cron(),
            daily_summary_cron: default_daily_summary_cron(),
            reengagement_cron: default_reengagement_cron(),
            trigger_window_minutes: default_trigger_window_minutes(),
            tracking_retention_months: default_tracking_retention_months(),
            execution_retention_months: default_execution_retention_months(),
            reengagement_limit: default_reengagement_limit(),
            inactivity_days: default_inactivity_days(),
            email_cooldown_days: default_email_cooldown_days(),
        }
    }
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_scheduled_campaigns_cron() -> String {
    "0 * * * * *".to_string()
}

fn default_automation_triggers_cron() -> String {
    "0 */5 * * * *".to_string()
}

fn default_cleanup_cron() -> String {
    "0 0 2 * * *".to_string()
}

fn default_daily_summary_cron() -> String {
    "0 0 9 * * *".to_string()
}

fn default_reengagement_cron() -> String {
    "0 0 10 * * Mon".to_string()
}

fn default_trigger_window_minutes() -> i64 {
    5
}

fn default_tracking_retention_months() -> u32 {
    6
}

fn default_execution_retention_months() -> u32 {
    3
}

fn default_reengagement_limit() -> i64 {
    100
}

fn default_inactivity_days() -> i64 {
    30
}

fn default_email_cooldown_days() -> i64 {
    7
}

impl Config {
    /// Load configuration from a single TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from the first config file found, overlaid with
    /// `ACREMAIL__SECTION__KEY` environment variables
    pub fn load() -> crate::Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
        {
            builder = builder.add_source(::config::File::from(path));
        }

        builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize::<Config>())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))
    }

    /// Check settings that have no usable default
    pub fn validate(&self) -> crate::Result<()> {
        if self.email.provider == "sendgrid" && self.email.sendgrid_api_key.is_none() {
            return Err(crate::Error::Config(
                "email.sendgrid_api_key is required for the sendgrid provider".to_string(),
            ));
        }

        if !matches!(self.email.provider.as_str(), "sendgrid" | "log") {
            return Err(crate::Error::Config(format!(
                "Unknown email provider: {}",
                self.email.provider
            )));
        }

        if self.tracking.unsubscribe_secret.as_deref().map_or(true, str::is_empty) {
            return Err(crate::Error::Config(
                "tracking.unsubscribe_secret must be set".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.hostname, "localhost");
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.email.unsubscribe_group_id, 1);
        assert_eq!(config.email.pacing(), Duration::from_millis(100));

        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.batch_size, 50);
        assert_eq!(config.queue.backoff_base(), Duration::from_secs(2));
        assert_eq!(config.queue.keep_completed, 100);
        assert_eq!(config.queue.keep_failed, 50);
        assert_eq!(config.queue.stall_timeout(), Duration::from_secs(600));
        assert_eq!(config.email.support_email, "support@landivo.com");

        assert_eq!(config.scheduler.reengagement_cron, "0 0 10 * * Mon");
        assert_eq!(config.scheduler.tracking_retention_months, 6);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[database]
url = "postgres://localhost/acremail"

[email]
provider = "log"
from_name = "Land Team"
reply_to = "deals@example.com"
support_email = "help@example.com"

[tracking]
base_url = "https://track.example.com"
unsubscribe_secret = "s3cret"

[queue]
batch_size = 25
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.database.url.as_deref(), Some("postgres://localhost/acremail"));
        assert_eq!(config.email.provider, "log");
        assert_eq!(config.email.from_name, "Land Team");
        assert_eq!(config.email.support_email, "help@example.com");
        assert_eq!(config.tracking.base_url, "https://track.example.com");
        assert_eq!(config.queue.batch_size, 25);
        assert_eq!(config.queue.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_secret_and_key() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config.email.sendgrid_api_key = Some("SG.key".to_string());
        assert!(config.validate().is_err());

        config.tracking.unsubscribe_secret = Some("secret".to_string());
        assert!(config.validate().is_ok());

        config.email.provider = "smtp".to_string();
        assert!(config.validate().is_err());
    }
}
