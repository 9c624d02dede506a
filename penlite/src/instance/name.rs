//! Validated instance names.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{PenliteError, PenliteResult};

/// Instance identifier: the unique name the instance is registered under.
///
/// Names are caller-chosen and passed through to the native layer, so the
/// accepted alphabet is the conservative intersection of what container
/// tooling tolerates: ASCII alphanumerics plus `.`, `_`, `-`, not starting
/// with `.` or `-`, at most 64 characters.
///
/// # Example
///
/// ```
/// use penlite::InstanceName;
///
/// let name = InstanceName::parse("web-frontend-01").unwrap();
/// assert_eq!(name.as_str(), "web-frontend-01");
/// assert!(InstanceName::parse("../escape").is_err());
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceName(String);

impl InstanceName {
    /// Maximum accepted name length.
    pub const MAX_LENGTH: usize = 64;

    /// Parse and validate an instance name.
    pub fn parse(s: &str) -> PenliteResult<Self> {
        if s.is_empty() {
            return Err(PenliteError::Config("instance name is empty".into()));
        }
        if s.len() > Self::MAX_LENGTH {
            return Err(PenliteError::Config(format!(
                "instance name exceeds {} characters: {}",
                Self::MAX_LENGTH,
                s
            )));
        }
        if s.starts_with('.') || s.starts_with('-') {
            return Err(PenliteError::Config(format!(
                "instance name must not start with '.' or '-': {}",
                s
            )));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(PenliteError::Config(format!(
                "instance name contains invalid characters: {}",
                s
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// Get the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceName({})", self.0)
    }
}

impl AsRef<str> for InstanceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for InstanceName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        for name in ["web", "db-replica-2", "a", "build_cache.v2"] {
            assert!(InstanceName::parse(name).is_ok(), "rejected {}", name);
        }
    }

    #[test]
    fn rejects_bad_names() {
        for name in ["", "-lead", ".hidden", "a/b", "has space", "café"] {
            assert!(InstanceName::parse(name).is_err(), "accepted {}", name);
        }
    }

    #[test]
    fn rejects_overlong_names() {
        let long = "x".repeat(InstanceName::MAX_LENGTH + 1);
        assert!(InstanceName::parse(&long).is_err());
        let max = "x".repeat(InstanceName::MAX_LENGTH);
        assert!(InstanceName::parse(&max).is_ok());
    }
}
