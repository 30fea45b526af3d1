//! Quota limits and details.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire value that stands for an unlimited quota.
pub const UNLIMITED_SENTINEL: i64 = -1;

/// Suffix of quota names that carry a limit but no usage.
pub const LIMIT_ONLY_SUFFIX: &str = "-limit";

/// A quota limit.
///
/// On the wire a limit is either a non-negative integer, the sentinel `-1`,
/// or the string `"unlimited"`. It always serializes back as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawLimit", into = "i64")]
pub enum QuotaLimit {
    /// No limit.
    Unlimited,
    /// At most this many.
    Finite(u64),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLimit {
    Number(i64),
    Text(String),
}

impl TryFrom<RawLimit> for QuotaLimit {
    type Error = String;

    fn try_from(raw: RawLimit) -> Result<Self, Self::Error> {
        match raw {
            RawLimit::Number(n) => Self::from_wire(n),
            RawLimit::Text(text) => text.parse(),
        }
    }
}

impl From<QuotaLimit> for i64 {
    fn from(limit: QuotaLimit) -> Self {
        limit.to_wire()
    }
}

impl QuotaLimit {
    /// Decode the integer wire form.
    pub fn from_wire(value: i64) -> Result<Self, String> {
        match value {
            UNLIMITED_SENTINEL => Ok(Self::Unlimited),
            n if n >= 0 => Ok(Self::Finite(n as u64)),
            n => Err(format!("invalid quota limit {}", n)),
        }
    }

    /// Encode to the integer wire form.
    pub fn to_wire(self) -> i64 {
        match self {
            Self::Unlimited => UNLIMITED_SENTINEL,
            Self::Finite(n) => n.min(i64::MAX as u64) as i64,
        }
    }

    /// Whether `usage` fits under this limit.
    pub fn admits(self, usage: u64) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Finite(limit) => usage <= limit,
        }
    }

    /// Finite value, or `u64::MAX` when unlimited.
    pub fn ceiling(self) -> u64 {
        match self {
            Self::Unlimited => u64::MAX,
            Self::Finite(n) => n,
        }
    }
}

impl Default for QuotaLimit {
    fn default() -> Self {
        Self::Unlimited
    }
}

impl fmt::Display for QuotaLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlimited => f.write_str("unlimited"),
            Self::Finite(n) => write!(f, "{}", n),
        }
    }
}

impl std::str::FromStr for QuotaLimit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("unlimited") {
            return Ok(Self::Unlimited);
        }
        let n: i64 = s
            .parse()
            .map_err(|_| format!("invalid quota limit '{}'", s))?;
        Self::from_wire(n)
    }
}

/// How a quota is accounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    /// Usage is counted against the limit.
    Counted,
    /// A bound on a single request value; no usage.
    LimitOnly,
}

impl QuotaKind {
    /// Classify a quota by name.
    pub fn of(name: &str) -> Self {
        if name.ends_with(LIMIT_ONLY_SUFFIX) {
            Self::LimitOnly
        } else {
            Self::Counted
        }
    }
}

/// Limit and usage of one quota for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDetails {
    pub name: String,
    pub limit: QuotaLimit,
    /// Absent for limit-only quotas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<u64>,
}

impl QuotaDetails {
    /// Details carrying only a limit, as used in update requests.
    pub fn limit(name: impl Into<String>, limit: QuotaLimit) -> Self {
        Self {
            name: name.into(),
            limit,
            usage: None,
        }
    }

    /// Headroom left under the limit. `None` when unlimited.
    pub fn remaining(&self) -> Option<u64> {
        match self.limit {
            QuotaLimit::Unlimited => None,
            QuotaLimit::Finite(n) => Some(n.saturating_sub(self.usage.unwrap_or(0))),
        }
    }
}

/// Durable per-tenant limit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRecord {
    pub tenant_id: String,
    pub name: String,
    pub limit: i64,
}

impl LimitRecord {
    /// Store key for a tenant's quota.
    ///
    /// The tenant id is length-prefixed, so ids and names may contain any
    /// character without two pairs sharing a key.
    pub fn key(tenant_id: &str, name: &str) -> String {
        format!("{}:{}/{}", tenant_id.len(), tenant_id, name)
    }
}
