//! Fan-in from raw connection bytes to the book, the trade window, and the
//! cache. One instance sits behind every feed connection's data callback.

use tracing::{error, warn};

use crate::cache::Cache;
use crate::events::{self, MarketEvent};
use crate::orderbook::OrderBook;
use crate::trades::TradeWindow;

pub struct DataProcessor<C: Cache> {
    book: OrderBook,
    window: TradeWindow,
    cache: C,
}

impl<C: Cache> DataProcessor<C> {
    pub fn new(cache: C) -> Self {
        Self {
            book: OrderBook::new(),
            window: TradeWindow::new(),
            cache,
        }
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    pub fn window(&self) -> &TradeWindow {
        &self.window
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Handle one complete feed message. Decode failures drop the message;
    /// cache failures are logged and swallowed. The cache write completes
    /// before this returns, so per-product state is materialized before the
    /// next message is taken off the socket.
    pub async fn process_incoming_data(&mut self, data: &[u8]) {
        let payload = match std::str::from_utf8(data) {
            Ok(payload) => payload,
            Err(err) => {
                error!(target: "main", error = %err, "feed message is not valid utf-8");
                return;
            }
        };

        match events::decode(payload) {
            Ok(MarketEvent::Snapshot(snapshot)) => {
                if let Err(err) = self.book.apply_snapshot(&snapshot) {
                    error!(target: "main", error = %err, "error applying snapshot");
                    return;
                }
                if let Err(err) = self
                    .book
                    .materialize(&snapshot.product_id, &mut self.cache)
                    .await
                {
                    warn!(target: "cache", error = %err, "orderbook write failed");
                }
            }
            Ok(MarketEvent::Update(update)) => {
                if let Err(err) = self.book.apply_update(&update) {
                    error!(target: "main", error = %err, "error applying update");
                    return;
                }
                if let Err(err) = self
                    .book
                    .materialize(&update.product_id, &mut self.cache)
                    .await
                {
                    warn!(target: "cache", error = %err, "orderbook write failed");
                }
            }
            Ok(MarketEvent::Match(matched)) => {
                self.window.record(matched);
                if let Err(err) = self.window.publish(&mut self.cache).await {
                    warn!(target: "cache", error = %err, "trade window write failed");
                }
            }
            Err(err) => {
                error!(target: "main", error = %err, "error parsing feed message");
            }
        }
    }
}
