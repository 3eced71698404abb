//! Identity and attempt types passed in by the authentication flow

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

static ATTEMPT_TYPE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9_-]{0,31}$").expect("attempt type pattern is valid")
});

/// Numeric account identifier used as the hot-path key
pub type AccountId = i64;

/// The account an attempt or action concerns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountIdentity {
    /// Numeric account id (hot-path key)
    pub id: AccountId,
    /// Stable external identifier
    pub external_id: Uuid,
    /// Login identifier (username or email)
    pub login: String,
}

impl AccountIdentity {
    /// Create a new account identity
    pub fn new(id: AccountId, external_id: Uuid, login: impl Into<String>) -> Self {
        Self {
            id,
            external_id,
            login: login.into(),
        }
    }

    /// Identity known only by its numeric id (nil external id, empty login)
    pub fn from_id(id: AccountId) -> Self {
        Self {
            id,
            external_id: Uuid::nil(),
            login: String::new(),
        }
    }
}

/// Organization the account belongs to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationContext {
    /// Numeric organization id
    pub id: Option<i64>,
    /// Stable external identifier
    pub external_id: Option<Uuid>,
}

impl OrganizationContext {
    /// Organization with both identifiers
    pub fn new(id: i64, external_id: Uuid) -> Self {
        Self {
            id: Some(id),
            external_id: Some(external_id),
        }
    }
}

/// Administrator performing a manual action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorIdentity {
    /// Numeric id of the acting account
    pub id: AccountId,
    /// Login of the acting account
    pub login: String,
}

impl ActorIdentity {
    /// Create a new actor identity
    pub fn new(id: AccountId, login: impl Into<String>) -> Self {
        Self {
            id,
            login: login.into(),
        }
    }
}

/// Classification of an authentication attempt (`password`, `ldap`, ...)
///
/// The set is open: any lowercase token matching `^[a-z][a-z0-9_-]{0,31}$` is
/// accepted, and the policy decides which ones are tracked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AttemptType(String);

impl AttemptType {
    /// Local password authentication
    pub const PASSWORD: &'static str = "password";
    /// External directory (LDAP) authentication
    pub const LDAP: &'static str = "ldap";

    /// Parse and validate an attempt type
    pub fn parse(value: &str) -> Result<Self, Error> {
        let normalized = value.trim().to_ascii_lowercase();
        if ATTEMPT_TYPE_PATTERN.is_match(&normalized) {
            Ok(Self(normalized))
        } else {
            Err(Error::InvalidAttemptType(value.to_string()))
        }
    }

    /// Password attempt type
    pub fn password() -> Self {
        Self(Self::PASSWORD.to_string())
    }

    /// LDAP attempt type
    pub fn ldap() -> Self {
        Self(Self::LDAP.to_string())
    }

    /// Borrow the normalized name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for AttemptType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AttemptType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AttemptType> for String {
    fn from(value: AttemptType) -> Self {
        value.0
    }
}

impl fmt::Display for AttemptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A rejected credential reported by the authentication flow
#[derive(Debug, Clone)]
pub struct FailedAttempt {
    /// Account the attempt targeted
    pub account: AccountIdentity,
    /// Organization of the account
    pub organization: OrganizationContext,
    /// How the credential was checked
    pub attempt_type: AttemptType,
    /// Client IP address
    pub source_ip: Option<String>,
    /// Client user agent
    pub user_agent: Option<String>,
    /// Name of the authentication source (directory name, provider, ...)
    pub auth_source: Option<String>,
}

impl FailedAttempt {
    /// Create a failed attempt with no request metadata
    pub fn new(
        account: AccountIdentity,
        organization: OrganizationContext,
        attempt_type: AttemptType,
    ) -> Self {
        Self {
            account,
            organization,
            attempt_type,
            source_ip: None,
            user_agent: None,
            auth_source: None,
        }
    }

    /// Set the client IP address
    pub fn with_source_ip(mut self, ip: impl Into<String>) -> Self {
        self.source_ip = Some(ip.into());
        self
    }

    /// Set the client user agent
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Set the authentication source
    pub fn with_auth_source(mut self, source: impl Into<String>) -> Self {
        self.auth_source = Some(source.into());
        self
    }
}
