//! Outreach configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{OutreachError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutreachConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

impl OutreachConfig {
    /// Load config from the default path (~/.outreach/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OutreachError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| OutreachError::Config(format!("Failed to parse config: {e}")))?;
        config.scheduler.validate()?;
        Ok(config)
    }

    /// Environment variables win over the file (deploy-time secrets).
    pub fn apply_env_overrides(&mut self) {
        if let Ok(provider) = std::env::var("OUTREACH_EMAIL_PROVIDER") {
            match provider.parse() {
                Ok(kind) => self.transport.provider = kind,
                Err(e) => tracing::warn!("⚠️ Ignoring OUTREACH_EMAIL_PROVIDER: {e}"),
            }
        }
        if let Ok(from) = std::env::var("OUTREACH_EMAIL_FROM") {
            self.transport.from = from;
        }
        if let Ok(key) = std::env::var("SENDGRID_API_KEY") {
            self.transport.sendgrid.api_key = key;
        }
        if let Ok(password) = std::env::var("OUTREACH_SMTP_PASSWORD") {
            self.transport.smtp.password = password;
        }
        if let Ok(path) = std::env::var("OUTREACH_DB_PATH") {
            self.database.path = path;
        }
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Outreach home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".outreach")
    }
}

/// SQLite database location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.outreach/outreach.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl DatabaseConfig {
    /// Path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

/// Send pass tuning: lock lease, pacing, retries, deferral.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between send passes in daemon mode.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_lock_name")]
    pub lock_name: String,
    /// How long an acquired run lock stays valid before another replica may take it.
    ///
    /// The normal pass never releases the lock, so a lone replica cannot start a
    /// new pass until the lease lapses: its effective cadence is the larger of
    /// this and `tick_interval_secs` (5 minutes with the defaults). Lower it
    /// toward the tick for faster cadence, keeping it above a pass's runtime.
    #[serde(default = "default_lock_lease")]
    pub lock_lease_secs: u64,
    /// 0 disables pacing.
    #[serde(default = "default_sends_per_second")]
    pub sends_per_second: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_failure_deferral")]
    pub failure_deferral_minutes: u64,
    /// 0 disables the deadline.
    #[serde(default)]
    pub pass_deadline_secs: u64,
}

fn default_tick_interval() -> u64 { 60 }
fn default_lock_name() -> String { "campaign_scheduler".into() }
fn default_lock_lease() -> u64 { 300 }
fn default_sends_per_second() -> f64 { 5.0 }
fn default_max_attempts() -> u32 { 3 }
fn default_backoff_base() -> u64 { 500 }
fn default_failure_deferral() -> u64 { 30 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            lock_name: default_lock_name(),
            lock_lease_secs: default_lock_lease(),
            sends_per_second: default_sends_per_second(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base(),
            failure_deferral_minutes: default_failure_deferral(),
            pass_deadline_secs: 0,
        }
    }
}

/// Upper bound for every duration setting (ten years).
const MAX_WINDOW_SECS: u64 = 10 * 365 * 24 * 60 * 60;

impl SchedulerConfig {
    /// Reject values the scheduler cannot turn into calendar arithmetic.
    pub fn validate(&self) -> Result<()> {
        let windows = [
            ("lock_lease_secs", self.lock_lease_secs),
            ("failure_deferral_minutes", self.failure_deferral_minutes.saturating_mul(60)),
            ("pass_deadline_secs", self.pass_deadline_secs),
        ];
        for (name, secs) in windows {
            if secs > MAX_WINDOW_SECS {
                return Err(OutreachError::Config(format!(
                    "scheduler.{name} exceeds ten years"
                )));
            }
        }
        if self.lock_lease_secs == 0 {
            return Err(OutreachError::Config("scheduler.lock_lease_secs must be positive".into()));
        }
        if !self.sends_per_second.is_finite() || self.sends_per_second < 0.0 {
            return Err(OutreachError::Config(format!(
                "scheduler.sends_per_second must be a non-negative number, got {}",
                self.sends_per_second
            )));
        }
        Ok(())
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    /// Minimum spacing between transport calls, `None` when pacing is off.
    pub fn send_spacing(&self) -> Option<Duration> {
        if self.sends_per_second.is_finite() && self.sends_per_second > 0.0 {
            Some(Duration::from_secs_f64(1.0 / self.sends_per_second))
        } else {
            None
        }
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn failure_deferral(&self) -> Duration {
        Duration::from_secs(self.failure_deferral_minutes.saturating_mul(60))
    }

    pub fn pass_deadline(&self) -> Option<Duration> {
        (self.pass_deadline_secs > 0).then(|| Duration::from_secs(self.pass_deadline_secs))
    }
}

/// Which delivery backend the process uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Smtp,
    SendGrid,
    /// Dry run: messages go to the log only.
    #[default]
    Log,
}

impl std::str::FromStr for TransportKind {
    type Err = OutreachError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "smtp" => Ok(TransportKind::Smtp),
            "sendgrid" => Ok(TransportKind::SendGrid),
            "log" | "mock" => Ok(TransportKind::Log),
            other => Err(OutreachError::Config(format!("Unknown email provider: {other}"))),
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Smtp => write!(f, "smtp"),
            TransportKind::SendGrid => write!(f, "sendgrid"),
            TransportKind::Log => write!(f, "log"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub provider: TransportKind,
    /// Sender address for every campaign message.
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub sendgrid: SendGridConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_smtp_timeout")]
    pub timeout_secs: u64,
}

fn default_smtp_port() -> u16 { 587 }
fn default_smtp_timeout() -> u64 { 30 }

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            timeout_secs: default_smtp_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendGridConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_sendgrid_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_sendgrid_timeout")]
    pub timeout_secs: u64,
}

fn default_sendgrid_endpoint() -> String { "https://api.sendgrid.com/v3/mail/send".into() }
fn default_sendgrid_timeout() -> u64 { 30 }

impl Default for SendGridConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: default_sendgrid_endpoint(),
            timeout_secs: default_sendgrid_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OutreachConfig::default();
        assert_eq!(config.scheduler.lock_name, "campaign_scheduler");
        assert_eq!(config.scheduler.max_attempts, 3);
        assert_eq!(config.transport.provider, TransportKind::Log);
        assert_eq!(config.scheduler.failure_deferral(), Duration::from_secs(30 * 60));
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [scheduler]
            sends_per_second = 2.0
            max_attempts = 5
            failure_deferral_minutes = 15

            [transport]
            provider = "sendgrid"
            from = "sales@example.com"

            [transport.sendgrid]
            api_key = "SG.test"
        "#;

        let config: OutreachConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.scheduler.max_attempts, 5);
        assert_eq!(config.scheduler.send_spacing(), Some(Duration::from_millis(500)));
        assert_eq!(config.transport.provider, TransportKind::SendGrid);
        assert_eq!(config.transport.sendgrid.api_key, "SG.test");
        assert_eq!(config.transport.smtp.port, 587);
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: OutreachConfig = toml::from_str("").unwrap();
        assert_eq!(config.scheduler.lock_lease_secs, 300);
        assert_eq!(config.database.path, "~/.outreach/outreach.db");
        assert!(config.scheduler.pass_deadline().is_none());
    }

    #[test]
    fn test_pacing_disabled() {
        let config = SchedulerConfig {
            sends_per_second: 0.0,
            ..Default::default()
        };
        assert!(config.send_spacing().is_none());
    }

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("SMTP".parse::<TransportKind>().unwrap(), TransportKind::Smtp);
        assert_eq!("mock".parse::<TransportKind>().unwrap(), TransportKind::Log);
        assert!("ses".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[database]\npath = \"/tmp/x.db\"\n").unwrap();
        let config = OutreachConfig::load_from(&path).unwrap();
        assert_eq!(config.database.resolved_path(), PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn test_load_rejects_out_of_range_scheduler_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        for bad in [
            "failure_deferral_minutes = 18446744073709551615",
            "failure_deferral_minutes = 6000000",
            "lock_lease_secs = 0",
            "pass_deadline_secs = 999999999999",
            "sends_per_second = -1.0",
        ] {
            std::fs::write(&path, format!("[scheduler]\n{bad}\n")).unwrap();
            let err = OutreachConfig::load_from(&path).unwrap_err();
            assert!(matches!(err, OutreachError::Config(_)), "{bad}: {err}");
        }

        std::fs::write(&path, "[scheduler]\nfailure_deferral_minutes = 1440\n").unwrap();
        assert!(OutreachConfig::load_from(&path).is_ok());
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_home_dir() {
        let home = OutreachConfig::home_dir();
        assert!(home.to_string_lossy().contains("outreach"));
    }
}
