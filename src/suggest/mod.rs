//! Adaptive interception suggestions
//!
//! When an unmatched domain is queried, a background probe compares its
//! reachability over the direct path against the path through the local
//! interceptor. Domains whose direct path is broken (or, in SPEEDUP mode,
//! consistently slower) get suggested for interception via a callback.
//!
//! Probing is memoized per domain with a one-hour window so a burst of
//! queries for the same name triggers at most one probe run.

mod cache;
mod probe;

use std::fmt;
use std::str::FromStr;

pub use cache::{ProbeCache, Prober};
pub use probe::{ProbeEngine, SuggestFn};

use crate::error::ConfigError;

/// Suggestion aggressiveness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuggestLevel {
    /// Never probe, never suggest
    Disable,
    /// Suggest only when the direct path is broken
    Block,
    /// Additionally credit the interceptor path for winning the race
    Speedup,
}

impl SuggestLevel {
    /// All recognized levels, in order of aggressiveness
    pub const ALL: [SuggestLevel; 3] = [
        SuggestLevel::Disable,
        SuggestLevel::Block,
        SuggestLevel::Speedup,
    ];

    /// Canonical configuration spelling of the level
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SuggestLevel::Disable => "DISABLE",
            SuggestLevel::Block => "BLOCK",
            SuggestLevel::Speedup => "SPEEDUP",
        }
    }
}

impl fmt::Display for SuggestLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SuggestLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str() == s)
            .ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "invalid suggest level: {s} (expected one of DISABLE, BLOCK, SPEEDUP)"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_round_trip() {
        for level in SuggestLevel::ALL {
            assert_eq!(level.as_str().parse::<SuggestLevel>().unwrap(), level);
        }
    }

    #[test]
    fn test_level_parse_rejects_unknown() {
        assert!("TURBO".parse::<SuggestLevel>().is_err());
        // Matching is exact, as in the config file
        assert!("speedup".parse::<SuggestLevel>().is_err());
    }
}
