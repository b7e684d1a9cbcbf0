//! Rolling one-second trade window published to the cache as a JSON array.

use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::cache::Cache;
use crate::errors::CacheError;
use crate::events::Match;

pub const TRADE_WINDOW: Duration = Duration::from_secs(1);
pub const MATCHES_KEY: &str = "matches";

#[derive(Debug)]
pub struct TradeWindow {
    matches: Vec<Match>,
    last_reset: Instant,
}

impl TradeWindow {
    pub fn new() -> Self {
        Self {
            matches: Vec::new(),
            last_reset: Instant::now(),
        }
    }

    /// Append a match, first clearing the window if it has aged out.
    pub fn record(&mut self, matched: Match) {
        if self.last_reset.elapsed() > TRADE_WINDOW {
            debug!(target: "main", dropped = self.matches.len(), "trade window rolled over");
            self.matches.clear();
            self.last_reset = Instant::now();
        }

        self.matches.push(matched);
    }

    pub fn matches(&self) -> &[Match] {
        &self.matches
    }

    /// Serialize the current window and `SET` it under [`MATCHES_KEY`].
    pub async fn publish<C: Cache + ?Sized>(&self, cache: &mut C) -> Result<(), CacheError> {
        let serialized = serde_json::to_string(&self.matches)?;
        cache.set(MATCHES_KEY, &serialized).await
    }
}

impl Default for TradeWindow {
    fn default() -> Self {
        Self::new()
    }
}
