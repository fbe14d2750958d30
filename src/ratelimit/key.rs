//! Composite keys for limiter entries.

use super::tier::Tier;

/// A key that uniquely identifies one limiter entry.
///
/// The scope is normally a tier name; custom limits use their own scope so
/// they never share state with a tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimitKey {
    /// Tier name or custom scope
    pub scope: String,
    /// Caller-supplied identifier (client address, user id, ...)
    pub identifier: String,
}

impl LimitKey {
    /// Create a key for a custom scope.
    pub fn new(scope: &str, identifier: &str) -> Self {
        Self {
            scope: scope.to_string(),
            identifier: identifier.to_string(),
        }
    }

    /// Create a key for a built-in tier.
    pub fn for_tier(tier: Tier, identifier: &str) -> Self {
        Self::new(tier.as_str(), identifier)
    }
}

impl std::fmt::Display for LimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scope, self.identifier)
    }
}
