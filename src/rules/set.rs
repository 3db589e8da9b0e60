//! The block/suggest/white rule triple and its atomic publication
//!
//! All three tries are rebuilt together from a config snapshot and published
//! with a single atomic swap, so a reader observes either the entire old
//! triple or the entire new one, never a mix.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::debug;

use super::trie::DomainTrie;
use crate::config::Config;
use crate::error::RuleError;

/// Maximum number of rules allowed per list.
///
/// Keeps a pathological configuration (or a runaway suggestion feed) from
/// exhausting memory. Typical curated lists run well under 200,000 entries.
pub const MAX_RULES: usize = 500_000;

/// How the dispatcher should treat a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Domain is whitelisted: always forward upstream, never intercept
    Whitelisted,
    /// Domain is on the block or suggest list: answer with the listener IP
    Intercept,
    /// No list matched: forward upstream and consider probing
    Unmatched,
}

/// An immutable snapshot of the three rule tries
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub block: DomainTrie,
    pub suggest: DomainTrie,
    pub white: DomainTrie,
}

impl RuleSet {
    /// Build a rule set from a configuration snapshot
    ///
    /// The relay host is always added to the white list so the tunnel's own
    /// endpoint can never be routed into itself.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::TooManyRules`] when any list exceeds
    /// [`MAX_RULES`]; the check runs before any trie is built.
    pub fn from_config(config: &Config) -> Result<Self, RuleError> {
        check_list_size("block", &config.block_list)?;
        check_list_size("suggest", &config.suggest_list)?;
        check_list_size("white", &config.white_list)?;

        let mut white = DomainTrie::from_rules(&config.white_list);
        if let Some(host) = config.relay_host() {
            white.insert(&host);
        }

        Ok(Self {
            block: DomainTrie::from_rules(&config.block_list),
            suggest: DomainTrie::from_rules(&config.suggest_list),
            white,
        })
    }

    /// Classify a domain against the triple
    ///
    /// White wins over block and suggest regardless of overlap.
    #[must_use]
    pub fn classify(&self, domain: &str) -> Classification {
        if self.white.matches(domain) {
            return Classification::Whitelisted;
        }
        if self.block.matches(domain) || self.suggest.matches(domain) {
            return Classification::Intercept;
        }
        Classification::Unmatched
    }
}

/// Shared handle to the current rule set
///
/// Readers are lock-free; a reload or a runtime suggestion append publishes
/// a complete new [`RuleSet`] via an atomic swap.
///
/// # Example
///
/// ```
/// use divert::rules::{Classification, SharedRules};
///
/// let rules = SharedRules::empty();
/// rules.add_suggestion("slow.net");
///
/// let snapshot = rules.snapshot();
/// assert_eq!(snapshot.classify("cdn.slow.net"), Classification::Intercept);
/// ```
pub struct SharedRules {
    inner: ArcSwap<RuleSet>,
}

impl SharedRules {
    /// Create a handle with no rules loaded
    #[must_use]
    pub fn empty() -> Self {
        Self {
            inner: ArcSwap::from_pointee(RuleSet::default()),
        }
    }

    /// Create a handle seeded from a configuration snapshot
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::TooManyRules`] when a list exceeds the cap;
    /// fatal at startup.
    pub fn from_config(config: &Config) -> Result<Self, RuleError> {
        Ok(Self {
            inner: ArcSwap::from_pointee(RuleSet::from_config(config)?),
        })
    }

    /// Get the current rule set snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.inner.load_full()
    }

    /// Rebuild all three tries from a configuration snapshot
    ///
    /// This is the configuration reload hook: the host calls it with the
    /// new config and the triple is swapped in atomically.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::TooManyRules`] when a list exceeds the cap; the
    /// previous rule set stays in place.
    pub fn rebuild(&self, config: &Config) -> Result<(), RuleError> {
        let set = RuleSet::from_config(config)?;
        debug!(
            block = set.block.len(),
            suggest = set.suggest.len(),
            white = set.white.len(),
            "reloaded rules"
        );
        self.inner.store(Arc::new(set));
        Ok(())
    }

    /// Append a domain to the suggest list at runtime
    ///
    /// Used as the suggestion callback target. The current set is copied,
    /// extended and swapped back in; concurrent appends are serialized by
    /// the swap loop.
    pub fn add_suggestion(&self, domain: &str) {
        self.inner.rcu(|current| {
            let mut set = RuleSet::clone(current.as_ref());
            set.suggest.insert(domain);
            set
        });
    }
}

fn check_list_size(list: &str, rules: &[String]) -> Result<(), RuleError> {
    if rules.len() > MAX_RULES {
        return Err(RuleError::TooManyRules {
            list: list.to_string(),
            count: rules.len(),
            max: MAX_RULES,
        });
    }
    Ok(())
}

impl std::fmt::Debug for SharedRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set = self.inner.load();
        f.debug_struct("SharedRules")
            .field("block", &set.block.len())
            .field("suggest", &set.suggest.len())
            .field("white", &set.white.len())
            .finish()
    }
}
