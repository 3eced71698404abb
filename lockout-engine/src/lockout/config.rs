//! Lockout policy configuration
//!
//! [`LockoutConfig`] is what config sources deserialize into. The engine never
//! reads it directly: [`LockoutPolicy::try_from`] validates it once at startup
//! and the resulting policy is shared read-only for the life of the engine.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::AttemptType;
use crate::audit::config::{AuditConfig, AuditPolicy};
use crate::error::{Error, Result};
use crate::resilience::CircuitBreakerConfig;

/// Sliding window for failure counters, in seconds
pub const FAILURE_WINDOW_SECS: u64 = 3600;

/// Upper bound accepted for `max_failed_attempts`
pub const MAX_FAILED_ATTEMPTS_CEILING: u32 = 100;

/// Upper bound accepted for `lockout_duration_minutes` (30 days)
pub const LOCKOUT_DURATION_CEILING_MINUTES: u32 = 43_200;

/// Upper bound accepted for `history.max_limit`
pub const HISTORY_LIMIT_CEILING: u32 = 500;

/// Lockout configuration as read from config sources
///
/// # Example (config.toml)
///
/// ```toml
/// [lockout]
/// enabled = true
/// max_failed_attempts = 5
/// lockout_duration_minutes = 15
/// lockout_type = "temporary"
/// fail_mode = "fail_open"
/// reset_on_success = true
/// track_attempt_types = ["password", "ldap"]
/// key_prefix = "lockout"
/// store_timeout_ms = 200
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockoutConfig {
    /// Whether lockout enforcement is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Failed attempts that lock the account
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u32,

    /// How long a temporary lock lasts, in minutes
    #[serde(default = "default_lockout_duration_minutes")]
    pub lockout_duration_minutes: u32,

    /// "temporary" (lock expires) or "permanent" (admin unlock required)
    #[serde(default = "default_lockout_type")]
    pub lockout_type: String,

    /// Outcome when the store cannot be consulted: "fail_open" or "fail_closed"
    #[serde(default = "default_fail_mode")]
    pub fail_mode: String,

    /// Clear the failure counter on successful login
    #[serde(default = "default_true")]
    pub reset_on_success: bool,

    /// Attempt types that count towards a lockout
    #[serde(default = "default_track_attempt_types")]
    pub track_attempt_types: Vec<String>,

    /// Redis key prefix for lockout keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Time budget for a single store call, in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Circuit breaker guarding the store
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Audit trail settings
    #[serde(default)]
    pub audit: AuditConfig,

    /// History retrieval settings
    #[serde(default)]
    pub history: HistoryConfig,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failed_attempts: default_max_failed_attempts(),
            lockout_duration_minutes: default_lockout_duration_minutes(),
            lockout_type: default_lockout_type(),
            fail_mode: default_fail_mode(),
            reset_on_success: true,
            track_attempt_types: default_track_attempt_types(),
            key_prefix: default_key_prefix(),
            store_timeout_ms: default_store_timeout_ms(),
            circuit_breaker: CircuitBreakerConfig::default(),
            audit: AuditConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

/// History retrieval settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Largest page a caller may request (hard ceiling 500)
    #[serde(default = "default_history_max_limit")]
    pub max_limit: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_limit: default_history_max_limit(),
        }
    }
}

/// How a lock ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockoutType {
    /// Lock expires after the configured duration
    Temporary,
    /// Lock stays until an administrator removes it
    Permanent,
}

impl FromStr for LockoutType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "temporary" => Ok(Self::Temporary),
            "permanent" => Ok(Self::Permanent),
            other => Err(Error::InvalidConfig(format!(
                "unrecognized lockout_type {:?} (expected \"temporary\" or \"permanent\")",
                other
            ))),
        }
    }
}

impl fmt::Display for LockoutType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temporary => write!(f, "temporary"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// Outcome applied when the store cannot be consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailMode {
    /// Treat the account as not locked (availability first)
    FailOpen,
    /// Treat the account as locked (security first)
    FailClosed,
}

impl FromStr for FailMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fail_open" | "open" => Ok(Self::FailOpen),
            "fail_closed" | "closed" => Ok(Self::FailClosed),
            other => Err(Error::InvalidConfig(format!(
                "unrecognized fail_mode {:?} (expected \"fail_open\" or \"fail_closed\")",
                other
            ))),
        }
    }
}

impl fmt::Display for FailMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailOpen => write!(f, "fail_open"),
            Self::FailClosed => write!(f, "fail_closed"),
        }
    }
}

/// Validated, immutable lockout policy
#[derive(Debug, Clone)]
pub struct LockoutPolicy {
    /// Whether enforcement is enabled
    pub enabled: bool,
    /// Failed attempts that lock the account
    pub max_failed_attempts: u32,
    /// Lock duration in minutes (ignored for permanent locks)
    pub lockout_duration_minutes: u32,
    /// How a lock ends
    pub lockout_type: LockoutType,
    /// Outcome when the store cannot be consulted
    pub fail_mode: FailMode,
    /// Clear the failure counter on successful login
    pub reset_on_success: bool,
    /// Attempt types that count towards a lockout
    pub tracked_attempt_types: BTreeSet<AttemptType>,
    /// Redis key prefix
    pub key_prefix: String,
    /// Time budget for a single store call
    pub store_timeout: Duration,
    /// Circuit breaker settings
    pub circuit_breaker: CircuitBreakerConfig,
    /// Audit settings
    pub audit: AuditPolicy,
    /// Largest history page
    pub history_max_limit: u32,
}

impl LockoutPolicy {
    /// Whether attempts of this type count towards a lockout
    pub fn tracks(&self, attempt_type: &AttemptType) -> bool {
        self.tracked_attempt_types.contains(attempt_type)
    }

    /// Lock duration in seconds
    pub fn lockout_duration_secs(&self) -> u64 {
        u64::from(self.lockout_duration_minutes) * 60
    }

    /// Lock duration as a chrono duration, `None` for permanent locks
    pub fn lock_ttl(&self) -> Option<chrono::Duration> {
        match self.lockout_type {
            LockoutType::Temporary => Some(chrono::Duration::minutes(i64::from(
                self.lockout_duration_minutes,
            ))),
            LockoutType::Permanent => None,
        }
    }

    /// Clamp a caller-supplied history limit to the configured maximum
    ///
    /// `None` and `0` mean "as many as allowed".
    pub fn clamp_history_limit(&self, requested: Option<u32>) -> u32 {
        match requested {
            Some(limit) if limit > 0 => limit.min(self.history_max_limit),
            _ => self.history_max_limit,
        }
    }
}

impl TryFrom<&LockoutConfig> for LockoutPolicy {
    type Error = Error;

    fn try_from(config: &LockoutConfig) -> Result<Self> {
        if config.max_failed_attempts == 0 || config.max_failed_attempts > MAX_FAILED_ATTEMPTS_CEILING
        {
            return Err(Error::InvalidConfig(format!(
                "max_failed_attempts must be between 1 and {}",
                MAX_FAILED_ATTEMPTS_CEILING
            )));
        }
        if config.lockout_duration_minutes == 0
            || config.lockout_duration_minutes > LOCKOUT_DURATION_CEILING_MINUTES
        {
            return Err(Error::InvalidConfig(format!(
                "lockout_duration_minutes must be between 1 and {}",
                LOCKOUT_DURATION_CEILING_MINUTES
            )));
        }
        let lockout_type: LockoutType = config.lockout_type.parse()?;
        let fail_mode: FailMode = config.fail_mode.parse()?;

        if config.track_attempt_types.is_empty() {
            return Err(Error::InvalidConfig(
                "track_attempt_types must not be empty".to_string(),
            ));
        }
        let tracked_attempt_types = config
            .track_attempt_types
            .iter()
            .map(|t| {
                AttemptType::parse(t).map_err(|_| {
                    Error::InvalidConfig(format!("invalid entry in track_attempt_types: {:?}", t))
                })
            })
            .collect::<Result<BTreeSet<_>>>()?;

        if config.key_prefix.is_empty() {
            return Err(Error::InvalidConfig("key_prefix must not be empty".to_string()));
        }
        if config.key_prefix.contains(':') {
            return Err(Error::InvalidConfig("key_prefix must not contain ':'".to_string()));
        }
        if config.key_prefix.contains(char::is_whitespace) {
            return Err(Error::InvalidConfig(
                "key_prefix must not contain whitespace".to_string(),
            ));
        }
        if config.store_timeout_ms == 0 || config.store_timeout_ms > 10_000 {
            return Err(Error::InvalidConfig(
                "store_timeout_ms must be between 1 and 10000".to_string(),
            ));
        }
        if config.circuit_breaker.failure_threshold == 0 {
            return Err(Error::InvalidConfig(
                "circuit_breaker.failure_threshold must be greater than 0".to_string(),
            ));
        }
        if config.circuit_breaker.timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "circuit_breaker.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if config.history.max_limit == 0 || config.history.max_limit > HISTORY_LIMIT_CEILING {
            return Err(Error::InvalidConfig(format!(
                "history.max_limit must be between 1 and {}",
                HISTORY_LIMIT_CEILING
            )));
        }
        let audit = config.audit.validate()?;

        Ok(Self {
            enabled: config.enabled,
            max_failed_attempts: config.max_failed_attempts,
            lockout_duration_minutes: config.lockout_duration_minutes,
            lockout_type,
            fail_mode,
            reset_on_success: config.reset_on_success,
            tracked_attempt_types,
            key_prefix: config.key_prefix.clone(),
            store_timeout: Duration::from_millis(config.store_timeout_ms),
            circuit_breaker: config.circuit_breaker.clone(),
            audit,
            history_max_limit: config.history.max_limit,
        })
    }
}

impl TryFrom<LockoutConfig> for LockoutPolicy {
    type Error = Error;

    fn try_from(config: LockoutConfig) -> Result<Self> {
        Self::try_from(&config)
    }
}

fn default_true() -> bool {
    true
}

fn default_max_failed_attempts() -> u32 {
    5
}

fn default_lockout_duration_minutes() -> u32 {
    15
}

fn default_lockout_type() -> String {
    "temporary".to_string()
}

fn default_fail_mode() -> String {
    "fail_open".to_string()
}

fn default_track_attempt_types() -> Vec<String> {
    vec![
        AttemptType::PASSWORD.to_string(),
        AttemptType::LDAP.to_string(),
    ]
}

fn default_key_prefix() -> String {
    "lockout".to_string()
}

fn default_store_timeout_ms() -> u64 {
    200
}

fn default_history_max_limit() -> u32 {
    50
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invalid(config: LockoutConfig) -> String {
        match LockoutPolicy::try_from(config) {
            Err(Error::InvalidConfig(msg)) => msg,
            other => panic!("expected InvalidConfig, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_default_config() {
        let config = LockoutConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_failed_attempts, 5);
        assert_eq!(config.lockout_duration_minutes, 15);
        assert_eq!(config.lockout_type, "temporary");
        assert_eq!(config.fail_mode, "fail_open");
        assert!(config.reset_on_success);
        assert_eq!(config.track_attempt_types, vec!["password", "ldap"]);
        assert_eq!(config.key_prefix, "lockout");
        assert_eq!(config.store_timeout_ms, 200);
        assert_eq!(config.history.max_limit, 50);
    }

    #[test]
    fn test_default_config_is_valid() {
        let policy = LockoutPolicy::try_from(LockoutConfig::default()).unwrap();
        assert_eq!(policy.lockout_type, LockoutType::Temporary);
        assert_eq!(policy.fail_mode, FailMode::FailOpen);
        assert_eq!(policy.lockout_duration_secs(), 900);
        assert_eq!(policy.store_timeout, Duration::from_millis(200));
        assert!(policy.tracks(&AttemptType::password()));
        assert!(policy.tracks(&AttemptType::ldap()));
        assert!(!policy.tracks(&AttemptType::parse("webauthn").unwrap()));
    }

    #[test]
    fn test_validate_max_failed_attempts_range() {
        let mut config = LockoutConfig::default();
        config.max_failed_attempts = 0;
        assert_eq!(invalid(config.clone()), "max_failed_attempts must be between 1 and 100");
        config.max_failed_attempts = 101;
        assert_eq!(invalid(config), "max_failed_attempts must be between 1 and 100");
    }

    #[test]
    fn test_validate_lockout_duration_range() {
        let mut config = LockoutConfig::default();
        config.lockout_duration_minutes = 0;
        assert!(invalid(config.clone()).starts_with("lockout_duration_minutes"));
        config.lockout_duration_minutes = LOCKOUT_DURATION_CEILING_MINUTES + 1;
        assert!(invalid(config).starts_with("lockout_duration_minutes"));
    }

    #[test]
    fn test_validate_unrecognized_lockout_type() {
        let mut config = LockoutConfig::default();
        config.lockout_type = "forever".to_string();
        assert!(invalid(config).contains("unrecognized lockout_type"));
    }

    #[test]
    fn test_validate_unrecognized_fail_mode() {
        let mut config = LockoutConfig::default();
        config.fail_mode = "fail_sideways".to_string();
        assert!(invalid(config).contains("unrecognized fail_mode"));
    }

    #[test]
    fn test_fail_mode_accepts_legacy_spelling() {
        assert_eq!("FAIL_CLOSED".parse::<FailMode>().unwrap(), FailMode::FailClosed);
        assert_eq!("fail-open".parse::<FailMode>().unwrap(), FailMode::FailOpen);
    }

    #[test]
    fn test_validate_attempt_types() {
        let mut config = LockoutConfig::default();
        config.track_attempt_types = vec![];
        assert_eq!(invalid(config.clone()), "track_attempt_types must not be empty");
        config.track_attempt_types = vec!["password".into(), "bad type".into()];
        assert!(invalid(config).contains("bad type"));
    }

    #[test]
    fn test_validate_key_prefix() {
        let mut config = LockoutConfig::default();
        config.key_prefix = "".to_string();
        assert_eq!(invalid(config.clone()), "key_prefix must not be empty");
        config.key_prefix = "my:prefix".to_string();
        assert_eq!(invalid(config.clone()), "key_prefix must not contain ':'");
        config.key_prefix = "my prefix".to_string();
        assert_eq!(invalid(config), "key_prefix must not contain whitespace");
    }

    #[test]
    fn test_validate_history_ceiling() {
        let mut config = LockoutConfig::default();
        config.history.max_limit = 501;
        assert!(invalid(config.clone()).starts_with("history.max_limit"));
        config.history.max_limit = 500;
        assert!(LockoutPolicy::try_from(config).is_ok());
    }

    #[test]
    fn test_validate_breaker_threshold() {
        let mut config = LockoutConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(invalid(config).starts_with("circuit_breaker.failure_threshold"));
    }

    #[test]
    fn test_validate_propagates_audit_errors() {
        let mut config = LockoutConfig::default();
        config.audit.mode = "eventually".to_string();
        assert!(invalid(config).contains("audit mode"));
    }

    #[test]
    fn test_clamp_history_limit() {
        let policy = LockoutPolicy::try_from(LockoutConfig::default()).unwrap();
        assert_eq!(policy.clamp_history_limit(None), 50);
        assert_eq!(policy.clamp_history_limit(Some(0)), 50);
        assert_eq!(policy.clamp_history_limit(Some(10)), 10);
        assert_eq!(policy.clamp_history_limit(Some(5000)), 50);
    }

    #[test]
    fn test_permanent_lock_has_no_ttl() {
        let mut config = LockoutConfig::default();
        config.lockout_type = "Permanent".to_string();
        let policy = LockoutPolicy::try_from(config).unwrap();
        assert_eq!(policy.lockout_type, LockoutType::Permanent);
        assert!(policy.lock_ttl().is_none());
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = LockoutConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: LockoutConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.max_failed_attempts, config.max_failed_attempts);
        assert_eq!(deserialized.fail_mode, config.fail_mode);
        assert_eq!(deserialized.key_prefix, config.key_prefix);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: LockoutConfig =
            serde_json::from_str(r#"{"max_failed_attempts": 3, "audit": {"mode": "sync"}}"#)
                .unwrap();
        assert_eq!(config.max_failed_attempts, 3);
        assert_eq!(config.lockout_duration_minutes, 15);
        assert_eq!(config.audit.mode, "sync");
        assert_eq!(config.audit.batch_size, 100);
    }
}
