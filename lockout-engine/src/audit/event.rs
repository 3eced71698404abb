//! Lockout audit event types
//!
//! One [`LockoutEvent`] is written per state transition of interest. Events are
//! append-only; nothing in this crate updates or deletes them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::lockout::types::{AccountIdentity, ActorIdentity, AttemptType, OrganizationContext};

/// A single lockout audit event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockoutEvent {
    /// Unique event identifier
    pub id: Uuid,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// What happened
    pub kind: LockoutEventKind,
    /// Account the event concerns
    pub account: AccountIdentity,
    /// Organization of the account
    pub organization: OrganizationContext,
    /// Failure count at the time of the event
    pub failure_count: Option<u32>,
    /// Configured lock duration in minutes
    pub lockout_duration_minutes: Option<u32>,
    /// When the lock was written
    pub locked_at: Option<DateTime<Utc>>,
    /// When the lock expires (absent for permanent locks)
    pub unlock_at: Option<DateTime<Utc>>,
    /// Attempt classification
    pub attempt_type: Option<AttemptType>,
    /// Client IP address
    pub source_ip: Option<String>,
    /// Client user agent
    pub user_agent: Option<String>,
    /// Authentication source name
    pub auth_source: Option<String>,
    /// Administrator who unlocked the account
    pub unlocked_by: Option<ActorIdentity>,
    /// Free-text or coded reason
    pub reason: Option<String>,
    /// Additional structured metadata
    pub metadata: Option<serde_json::Value>,
}

impl LockoutEvent {
    /// Create an event with only the identity fields set
    pub fn new(
        kind: LockoutEventKind,
        account: AccountIdentity,
        organization: OrganizationContext,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            timestamp,
            kind,
            account,
            organization,
            failure_count: None,
            lockout_duration_minutes: None,
            locked_at: None,
            unlock_at: None,
            attempt_type: None,
            source_ip: None,
            user_agent: None,
            auth_source: None,
            unlocked_by: None,
            reason: None,
            metadata: None,
        }
    }

    /// Set the failure count
    pub fn with_failure_count(mut self, count: u32) -> Self {
        self.failure_count = Some(count);
        self
    }

    /// Set the lock window
    pub fn with_lock_window(
        mut self,
        locked_at: DateTime<Utc>,
        unlock_at: Option<DateTime<Utc>>,
        duration_minutes: u32,
    ) -> Self {
        self.locked_at = Some(locked_at);
        self.unlock_at = unlock_at;
        self.lockout_duration_minutes = Some(duration_minutes);
        self
    }

    /// Set attempt details
    pub fn with_attempt(
        mut self,
        attempt_type: AttemptType,
        source_ip: Option<String>,
        user_agent: Option<String>,
        auth_source: Option<String>,
    ) -> Self {
        self.attempt_type = Some(attempt_type);
        self.source_ip = source_ip;
        self.user_agent = user_agent;
        self.auth_source = auth_source;
        self
    }

    /// Set the unlocking administrator
    pub fn with_unlocked_by(mut self, actor: ActorIdentity) -> Self {
        self.unlocked_by = Some(actor);
        self
    }

    /// Set the reason
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Set additional metadata
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Lockout event categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockoutEventKind {
    /// A tracked authentication attempt failed
    FailedAttempt,
    /// The failure threshold was reached and the account locked
    AccountLocked,
    /// A lock expired on its own
    AccountUnlockedAuto,
    /// An administrator removed a lock
    AccountUnlockedAdmin,
    /// A successful login cleared the failure counter
    SuccessfulLogin,
}

impl LockoutEventKind {
    /// Stable event type code
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FailedAttempt => "FAILED_ATTEMPT",
            Self::AccountLocked => "ACCOUNT_LOCKED",
            Self::AccountUnlockedAuto => "ACCOUNT_UNLOCKED_AUTO",
            Self::AccountUnlockedAdmin => "ACCOUNT_UNLOCKED_ADMIN",
            Self::SuccessfulLogin => "SUCCESSFUL_LOGIN",
        }
    }
}

impl fmt::Display for LockoutEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockoutEventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FAILED_ATTEMPT" => Ok(Self::FailedAttempt),
            "ACCOUNT_LOCKED" => Ok(Self::AccountLocked),
            "ACCOUNT_UNLOCKED_AUTO" => Ok(Self::AccountUnlockedAuto),
            "ACCOUNT_UNLOCKED_ADMIN" => Ok(Self::AccountUnlockedAdmin),
            "SUCCESSFUL_LOGIN" => Ok(Self::SuccessfulLogin),
            other => Err(Error::Storage(format!("unknown event type {:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> AccountIdentity {
        AccountIdentity::new(42, Uuid::nil(), "alice")
    }

    #[test]
    fn test_kind_serializes_as_event_code() {
        let json = serde_json::to_string(&LockoutEventKind::AccountUnlockedAdmin).unwrap();
        assert_eq!(json, "\"ACCOUNT_UNLOCKED_ADMIN\"");
        assert_eq!(
            LockoutEventKind::AccountLocked.to_string(),
            "ACCOUNT_LOCKED"
        );
    }

    #[test]
    fn test_kind_parses_event_code() {
        for kind in [
            LockoutEventKind::FailedAttempt,
            LockoutEventKind::AccountLocked,
            LockoutEventKind::AccountUnlockedAuto,
            LockoutEventKind::AccountUnlockedAdmin,
            LockoutEventKind::SuccessfulLogin,
        ] {
            assert_eq!(kind.as_str().parse::<LockoutEventKind>().unwrap(), kind);
        }
        assert!("ACCOUNT_DELETED".parse::<LockoutEventKind>().is_err());
    }

    #[test]
    fn test_lock_event_builder() {
        let now = Utc::now();
        let unlock_at = now + chrono::Duration::minutes(15);
        let event = LockoutEvent::new(
            LockoutEventKind::AccountLocked,
            account(),
            OrganizationContext::default(),
            now,
        )
        .with_failure_count(5)
        .with_lock_window(now, Some(unlock_at), 15);

        assert_eq!(event.failure_count, Some(5));
        assert_eq!(event.locked_at, Some(now));
        assert_eq!(event.unlock_at, Some(unlock_at));
        assert_eq!(event.lockout_duration_minutes, Some(15));
        assert!(event.unlocked_by.is_none());
    }

    #[test]
    fn test_events_get_distinct_ids() {
        let now = Utc::now();
        let a = LockoutEvent::new(
            LockoutEventKind::FailedAttempt,
            account(),
            OrganizationContext::default(),
            now,
        );
        let b = LockoutEvent::new(
            LockoutEventKind::FailedAttempt,
            account(),
            OrganizationContext::default(),
            now,
        );
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_admin_unlock_event_serialization() {
        let event = LockoutEvent::new(
            LockoutEventKind::AccountUnlockedAdmin,
            account(),
            OrganizationContext::default(),
            Utc::now(),
        )
        .with_unlocked_by(ActorIdentity::new(1, "admin"))
        .with_reason("verified by phone")
        .with_metadata(serde_json::json!({"ticket": "SUP-1"}));

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "ACCOUNT_UNLOCKED_ADMIN");
        assert_eq!(value["unlocked_by"]["login"], "admin");
        assert_eq!(value["reason"], "verified by phone");
        assert_eq!(value["metadata"]["ticket"], "SUP-1");
    }
}
