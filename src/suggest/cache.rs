//! Single-flight probe memoization
//!
//! [`ProbeCache::remember`] runs the prober at most once per domain per TTL
//! window. Concurrent callers for the same domain coalesce onto the one
//! in-flight run instead of launching their own.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;

/// One-hour suppression window per probed domain
const PROBE_TTL: Duration = Duration::from_secs(60 * 60);

/// Upper bound on remembered domains
const MAX_ENTRIES: u64 = 65_536;

/// A producer invoked at most once per key per TTL window
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe a single domain. Failures are the prober's own business; the
    /// cache records completion either way.
    async fn probe_one(&self, domain: &str);
}

/// Memoizing single-flight wrapper around a [`Prober`]
///
/// The cache stores only a completion marker: it suppresses repeat probing,
/// it does not cache DNS answers.
pub struct ProbeCache {
    seen: Cache<String, ()>,
    prober: Arc<dyn Prober>,
}

impl ProbeCache {
    /// Create a cache around the given prober
    #[must_use]
    pub fn new(prober: Arc<dyn Prober>) -> Self {
        Self {
            seen: Cache::builder()
                .max_capacity(MAX_ENTRIES)
                .time_to_live(PROBE_TTL)
                .build(),
            prober,
        }
    }

    /// Probe `domain` unless it was already probed within the TTL window
    ///
    /// The domain key is normalized to its non-FQDN form (trailing dot
    /// stripped). Concurrent calls for the same key share one execution.
    pub async fn remember(&self, domain: &str) {
        let key = domain.trim_end_matches('.').to_string();
        if key.is_empty() {
            return;
        }

        let prober = Arc::clone(&self.prober);
        let domain = key.clone();
        self.seen
            .get_with(key, async move {
                prober.probe_one(&domain).await;
            })
            .await;
    }
}

impl std::fmt::Debug for ProbeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeCache")
            .field("entries", &self.seen.entry_count())
            .finish()
    }
}
