//! Audit trail configuration
//!
//! Loaded from the `[lockout.audit]` section of config.toml or environment
//! variables, then validated into an [`AuditPolicy`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Audit trail configuration as read from config sources
///
/// # Example (config.toml)
///
/// ```toml
/// [lockout.audit]
/// enabled = true
/// log_failed_attempts = true
/// log_successful_logins = false
/// mode = "async"
/// queue_size = 1000
/// batch_size = 100
/// flush_interval_ms = 1000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Write lockout events to the audit trail (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Emit an event for every tracked failed attempt (default: true)
    #[serde(default = "default_true")]
    pub log_failed_attempts: bool,

    /// Emit an event when a successful login clears the counter (default: false)
    #[serde(default)]
    pub log_successful_logins: bool,

    /// Write mode: "sync" or "async"
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Capacity of the async queue
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Events per flush in async mode
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum time an event waits in the batch before a flush, in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_failed_attempts: true,
            log_successful_logins: false,
            mode: default_mode(),
            queue_size: default_queue_size(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl AuditConfig {
    /// Validate the configuration and produce the effective policy
    pub fn validate(&self) -> Result<AuditPolicy> {
        let mode: AuditMode = self.mode.parse()?;
        if self.queue_size == 0 {
            return Err(Error::InvalidConfig(
                "audit.queue_size must be greater than 0".to_string(),
            ));
        }
        if self.batch_size == 0 || self.batch_size > self.queue_size {
            return Err(Error::InvalidConfig(format!(
                "audit.batch_size must be between 1 and queue_size ({})",
                self.queue_size
            )));
        }
        if self.flush_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "audit.flush_interval_ms must be greater than 0".to_string(),
            ));
        }

        Ok(AuditPolicy {
            enabled: self.enabled,
            log_failed_attempts: self.log_failed_attempts,
            log_successful_logins: self.log_successful_logins,
            mode,
            queue_size: self.queue_size,
            batch_size: self.batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
        })
    }
}

/// How the audit pipeline writes events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditMode {
    /// Every event is written before `emit` returns
    Sync,
    /// Events are queued and written in batches by a background worker
    Async,
}

impl FromStr for AuditMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" | "synchronous" => Ok(Self::Sync),
            "async" | "asynchronous" => Ok(Self::Async),
            other => Err(Error::InvalidConfig(format!(
                "unrecognized audit mode {:?} (expected \"sync\" or \"async\")",
                other
            ))),
        }
    }
}

impl fmt::Display for AuditMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Async => write!(f, "async"),
        }
    }
}

/// Validated audit settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditPolicy {
    /// Whether events are written at all
    pub enabled: bool,
    /// Emit `FAILED_ATTEMPT` events
    pub log_failed_attempts: bool,
    /// Emit `SUCCESSFUL_LOGIN` events
    pub log_successful_logins: bool,
    /// Write mode
    pub mode: AuditMode,
    /// Async queue capacity
    pub queue_size: usize,
    /// Async batch size
    pub batch_size: usize,
    /// Async flush interval
    pub flush_interval: Duration,
}

impl Default for AuditPolicy {
    fn default() -> Self {
        // Defaults always validate
        AuditPolicy {
            enabled: true,
            log_failed_attempts: true,
            log_successful_logins: false,
            mode: AuditMode::Async,
            queue_size: default_queue_size(),
            batch_size: default_batch_size(),
            flush_interval: Duration::from_millis(default_flush_interval_ms()),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_mode() -> String {
    "async".to_string()
}

fn default_queue_size() -> usize {
    1000
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval_ms() -> u64 {
    1000
}
