//! Configuration types and loading
//!
//! Configuration is a single JSON document. Loading and hot-reload plumbing
//! belong to the host; the core consumes snapshots of [`Config`] and exposes
//! [`crate::rules::SharedRules::rebuild`] as the reload hook target.

mod loader;
mod types;

pub use loader::{load_config, parse_config};
pub use types::{Config, LogConfig, RelayConfig, TransportKind};
