//! Policy attributes and their values

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::PolicyError;

/// A size limit in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quota {
    Unlimited,
    Bytes(u64),
}

impl Quota {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Quota::Unlimited)
    }

    pub fn bytes(&self) -> Option<u64> {
        match self {
            Quota::Unlimited => None,
            Quota::Bytes(bytes) => Some(*bytes),
        }
    }

    /// True when `size` fits under the limit.
    pub fn allows(&self, size: u64) -> bool {
        self.bytes().map_or(true, |limit| size <= limit)
    }
}

impl Ord for Quota {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Quota::Unlimited, Quota::Unlimited) => Ordering::Equal,
            (Quota::Unlimited, Quota::Bytes(_)) => Ordering::Greater,
            (Quota::Bytes(_), Quota::Unlimited) => Ordering::Less,
            (Quota::Bytes(a), Quota::Bytes(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Quota {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quota::Unlimited => f.write_str("unlimited"),
            Quota::Bytes(bytes) => write!(f, "{bytes} bytes"),
        }
    }
}

impl FromStr for Quota {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("unlimited") {
            return Ok(Quota::Unlimited);
        }
        s.trim()
            .parse::<u64>()
            .map(Quota::Bytes)
            .map_err(|_| PolicyError::InvalidValue(format!("invalid quota: {s}")))
    }
}

/// What happens when a write would exceed the resolved quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExceededHandling {
    /// Fail the write with a quota-exceeded error.
    Deny,
    /// Suspend the write and ask the user for more space.
    Ask,
    /// Ignore quotas; only the engine's own ceiling applies.
    Allow,
}

impl ExceededHandling {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExceededHandling::Deny => "deny",
            ExceededHandling::Ask => "ask",
            ExceededHandling::Allow => "allow",
        }
    }
}

impl fmt::Display for ExceededHandling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExceededHandling {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deny" => Ok(ExceededHandling::Deny),
            "ask" => Ok(ExceededHandling::Ask),
            "allow" => Ok(ExceededHandling::Allow),
            _ => Err(PolicyError::InvalidValue(format!(
                "invalid exceeded handling: {s}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessPolicy {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    /// Total bytes all origins of a class may use in one context.
    GlobalQuota,
    /// Bytes one origin may use.
    OriginQuota,
    ExceededHandling,
    /// Objects one origin may create, 0 for no limit.
    MaxObjectsPerOrigin,
    /// Execution budget per statement in milliseconds, 0 for none.
    QueryTimeout,
    /// Byte budget for an eagerly cached result set.
    MaxResultSetSize,
    /// Whether objects may be opened at all.
    Access,
}

impl Attribute {
    pub const ALL: [Attribute; 7] = [
        Attribute::GlobalQuota,
        Attribute::OriginQuota,
        Attribute::ExceededHandling,
        Attribute::MaxObjectsPerOrigin,
        Attribute::QueryTimeout,
        Attribute::MaxResultSetSize,
        Attribute::Access,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Attribute::GlobalQuota => "global_quota",
            Attribute::OriginQuota => "origin_quota",
            Attribute::ExceededHandling => "exceeded_handling",
            Attribute::MaxObjectsPerOrigin => "max_objects_per_origin",
            Attribute::QueryTimeout => "query_timeout",
            Attribute::MaxResultSetSize => "max_result_set_size",
            Attribute::Access => "access",
        }
    }

    /// Whether `value` has the right shape for this attribute.
    pub fn accepts(&self, value: &AttributeValue) -> bool {
        matches!(
            (self, value),
            (Attribute::GlobalQuota, AttributeValue::Quota(_))
                | (Attribute::OriginQuota, AttributeValue::Quota(_))
                | (Attribute::MaxResultSetSize, AttributeValue::Quota(_))
                | (Attribute::ExceededHandling, AttributeValue::Handling(_))
                | (Attribute::MaxObjectsPerOrigin, AttributeValue::Count(_))
                | (Attribute::QueryTimeout, AttributeValue::Millis(_))
                | (Attribute::Access, AttributeValue::Access(_))
        )
    }

    /// Engine default returned by the root node.
    pub fn root_default(&self) -> AttributeValue {
        match self {
            Attribute::GlobalQuota | Attribute::OriginQuota | Attribute::MaxResultSetSize => {
                AttributeValue::Quota(Quota::Unlimited)
            }
            Attribute::ExceededHandling => AttributeValue::Handling(ExceededHandling::Deny),
            Attribute::MaxObjectsPerOrigin => AttributeValue::Count(0),
            Attribute::QueryTimeout => AttributeValue::Millis(0),
            Attribute::Access => AttributeValue::Access(AccessPolicy::Allow),
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeValue {
    Quota(Quota),
    Handling(ExceededHandling),
    Count(u32),
    Millis(u32),
    Access(AccessPolicy),
}

impl AttributeValue {
    pub fn as_quota(&self) -> Option<Quota> {
        match self {
            AttributeValue::Quota(quota) => Some(*quota),
            _ => None,
        }
    }

    pub fn as_handling(&self) -> Option<ExceededHandling> {
        match self {
            AttributeValue::Handling(handling) => Some(*handling),
            _ => None,
        }
    }

    pub fn as_count(&self) -> Option<u32> {
        match self {
            AttributeValue::Count(count) => Some(*count),
            _ => None,
        }
    }

    /// Timeout as a duration, `None` when disabled.
    pub fn as_timeout(&self) -> Option<Duration> {
        match self {
            AttributeValue::Millis(0) => None,
            AttributeValue::Millis(ms) => Some(Duration::from_millis(u64::from(*ms))),
            _ => None,
        }
    }

    pub fn as_access(&self) -> Option<AccessPolicy> {
        match self {
            AttributeValue::Access(access) => Some(*access),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_ordering() {
        assert!(Quota::Unlimited > Quota::Bytes(u64::MAX));
        assert!(Quota::Bytes(10) < Quota::Bytes(11));
        assert_eq!(Quota::Bytes(3).min(Quota::Unlimited), Quota::Bytes(3));
    }

    #[test]
    fn test_quota_parse() {
        assert_eq!("unlimited".parse::<Quota>().unwrap(), Quota::Unlimited);
        assert_eq!("1024".parse::<Quota>().unwrap(), Quota::Bytes(1024));
        assert!("lots".parse::<Quota>().is_err());
    }

    #[test]
    fn test_quota_allows() {
        assert!(Quota::Bytes(10).allows(10));
        assert!(!Quota::Bytes(10).allows(11));
        assert!(Quota::Unlimited.allows(u64::MAX));
    }

    #[test]
    fn test_attribute_shapes() {
        for attribute in Attribute::ALL {
            assert!(attribute.accepts(&attribute.root_default()));
        }
        assert!(!Attribute::OriginQuota.accepts(&AttributeValue::Count(3)));
    }

    #[test]
    fn test_timeout_disabled_at_zero() {
        assert_eq!(AttributeValue::Millis(0).as_timeout(), None);
        assert_eq!(
            AttributeValue::Millis(250).as_timeout(),
            Some(Duration::from_millis(250))
        );
    }
}
