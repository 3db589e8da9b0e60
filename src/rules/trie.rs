//! Suffix trie over DNS labels
//!
//! Rules are stored as reversed-label paths: "ads.example.com" becomes the
//! path `com -> example -> ads` with a terminal marker on the last node. A
//! domain matches when walking its own reversed labels reaches any terminal
//! node, which gives implicit wildcard semantics for subdomains.
//!
//! Matching is O(L) in the number of labels, independent of rule count.
//! Tries are immutable once published; reloads build a fresh trie and swap
//! it in wholesale (see [`super::SharedRules`]).

use std::collections::HashMap;

/// A suffix trie keyed by DNS labels in reverse order
///
/// # Example
///
/// ```
/// use divert::rules::DomainTrie;
///
/// let mut trie = DomainTrie::new();
/// trie.insert("example.com");
///
/// assert!(trie.matches("example.com"));
/// assert!(trie.matches("mail.example.com"));
/// assert!(!trie.matches("notexample.com"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct DomainTrie {
    root: Node,
    len: usize,
}

#[derive(Debug, Clone, Default)]
struct Node {
    children: HashMap<String, Node>,
    terminal: bool,
}

impl DomainTrie {
    /// Create an empty trie
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a trie from a list of suffix rules
    ///
    /// Empty entries and comment lines (starting with `#`) are skipped.
    pub fn from_rules<I, S>(rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut trie = Self::new();
        for rule in rules {
            trie.insert(rule.as_ref());
        }
        trie
    }

    /// Insert a suffix rule
    ///
    /// Rules are normalized to lowercase with surrounding dots stripped.
    /// Insertion is idempotent: re-inserting an existing rule is a no-op.
    pub fn insert(&mut self, rule: &str) {
        let rule = rule.trim().trim_matches('.').to_ascii_lowercase();
        if rule.is_empty() || rule.starts_with('#') {
            return;
        }

        let mut node = &mut self.root;
        for label in rule.rsplit('.') {
            node = node.children.entry(label.to_string()).or_default();
        }
        if !node.terminal {
            node.terminal = true;
            self.len += 1;
        }
    }

    /// Check whether a domain matches any rule in the trie
    ///
    /// A trailing dot (FQDN form) is stripped before matching. The walk
    /// succeeds as soon as a terminal node is reached, whether or not
    /// labels remain, so `a.b.example.com` matches a rule `example.com`.
    #[must_use]
    pub fn matches(&self, domain: &str) -> bool {
        let domain = domain.strip_suffix('.').unwrap_or(domain);
        if domain.is_empty() {
            return false;
        }

        let mut node = &self.root;
        for label in domain.rsplit('.') {
            match node.children.get(&label.to_ascii_lowercase()) {
                Some(next) => {
                    node = next;
                    if node.terminal {
                        return true;
                    }
                }
                None => return false,
            }
        }
        false
    }

    /// Number of rules in the trie
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the trie has no rules
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
