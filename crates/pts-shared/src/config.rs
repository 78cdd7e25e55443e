//! # PTS Configuration
//!
//! Layered configuration: a `pts.toml` file (optional) overridden by
//! `PTS_`-prefixed environment variables. All sections carry defaults so a
//! bare process comes up with a usable development configuration.

use chrono::NaiveDate;
use serde::Deserialize;

use crate::error::{PtsError, PtsResult};

/// Top-level configuration for all PTS services.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PtsConfig {
    /// Fully qualified domain the system receives mail for.
    pub fqdn: String,
    /// Address accepting control command mails.
    pub control_email: String,
    /// Contact address advertised to users and Cc'd on bounce notifications.
    pub contact_email: String,
    /// From address used for the bounce-threshold notification mail.
    pub bounces_email: String,
    /// Active vendor, selected at boot. `"null"` disables all hooks.
    pub vendor: String,
    pub smtp: SmtpConfig,
    /// Timeout for HTTP calls made from vendor hooks, in seconds.
    pub http_timeout_seconds: u64,
    pub bounce_policy: BouncePolicyConfig,
    /// Lifetime of command confirmation tokens, in hours.
    pub confirmation_ttl_hours: i64,
    /// Per-task deadline inside a job, in seconds. Expiry is a task failure.
    pub task_deadline_seconds: u64,
}

/// SMTP relay endpoint used for all outbound mail.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    /// Per-call timeout for handshake and DATA, in seconds.
    pub timeout_seconds: u64,
}

/// The "too many bounces" predicate: a user crosses the threshold when,
/// over the last `window_days` of records, at least `required_days` days
/// have `bounced / max(sent, 1) > ratio`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BouncePolicyConfig {
    pub window_days: usize,
    pub required_days: usize,
    pub ratio: f64,
}

impl Default for PtsConfig {
    fn default() -> Self {
        Self {
            fqdn: "pts.example.org".to_string(),
            control_email: "control@pts.example.org".to_string(),
            contact_email: "owner@pts.example.org".to_string(),
            bounces_email: "bounces@pts.example.org".to_string(),
            vendor: "null".to_string(),
            smtp: SmtpConfig::default(),
            http_timeout_seconds: 15,
            bounce_policy: BouncePolicyConfig::default(),
            confirmation_ttl_hours: 48,
            task_deadline_seconds: 3600,
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 25,
            timeout_seconds: 30,
        }
    }
}

impl Default for BouncePolicyConfig {
    fn default() -> Self {
        Self {
            window_days: 7,
            required_days: 5,
            ratio: 0.5,
        }
    }
}

impl PtsConfig {
    /// Load configuration from `pts.toml` (if present) and `PTS_*` environment
    /// variables. Nested keys use `__` in the environment, e.g.
    /// `PTS_SMTP__HOST`.
    pub fn load() -> PtsResult<Self> {
        Self::load_from("pts")
    }

    /// Load from a named config file base (without extension). Used by tests
    /// to point at scratch files.
    pub fn load_from(base: &str) -> PtsResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(base).required(false))
            .add_source(config::Environment::with_prefix("PTS").separator("__"))
            .build()
            .map_err(|e| PtsError::Configuration(format!("failed to read configuration: {e}")))?;

        let config: PtsConfig = settings
            .try_deserialize()
            .map_err(|e| PtsError::Configuration(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> PtsResult<()> {
        if self.fqdn.is_empty() {
            return Err(PtsError::Configuration("fqdn must not be empty".into()));
        }
        if !self.control_email.contains('@') {
            return Err(PtsError::Configuration(format!(
                "control_email is not an address: {}",
                self.control_email
            )));
        }
        if self.bounce_policy.required_days > self.bounce_policy.window_days {
            return Err(PtsError::Configuration(
                "bounce_policy.required_days exceeds window_days".into(),
            ));
        }
        Ok(())
    }

    /// The per-package loop address placed in and checked against `X-Loop`.
    pub fn package_address(&self, package: &str) -> String {
        format!("{package}@{}", self.fqdn)
    }

    /// The dated bounce return path, before VERP wrapping.
    pub fn bounce_address(&self, date: NaiveDate) -> String {
        format!("bounces+{}@{}", date.format("%Y%m%d"), self.fqdn)
    }
}
