//! Domain rule matching
//!
//! Rules are plain domain suffixes ("example.com" matches itself and every
//! subdomain). Three independent rule sets drive the DNS dispatcher: *block*,
//! *suggest* and *white*, with *white* taking precedence over the other two.

mod set;
mod trie;

pub use set::{Classification, RuleSet, SharedRules, MAX_RULES};
pub use trie::DomainTrie;
