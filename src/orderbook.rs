//! Per-product L2 order book.
//!
//! Snapshots set the listed levels outright; updates are deltas. Books are
//! created lazily on the first message for a product and never removed.
//! All mutation happens on the session loop thread, so messages for one
//! product are applied strictly in receive order.

use std::collections::{BTreeMap, HashMap};

use ordered_float::OrderedFloat;
use tracing::debug;

use crate::cache::Cache;
use crate::errors::{CacheError, DecodeError};
use crate::events::{Side, Snapshot, Update};

/// Levels at or below this size are treated as removed.
pub const MIN_LEVEL_SIZE: f64 = 1e-11;

pub type PriceLevels = BTreeMap<OrderedFloat<f64>, f64>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductBook {
    pub bids: PriceLevels,
    pub asks: PriceLevels,
}

#[derive(Debug, Default)]
pub struct OrderBook {
    products: HashMap<String, ProductBook>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn product(&self, product_id: &str) -> Option<&ProductBook> {
        self.products.get(product_id)
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    /// Apply an absolute snapshot: every listed level is set to the given
    /// size. Levels the snapshot does not mention are left alone.
    ///
    /// The whole message is parsed before any level is touched, so a
    /// malformed entry drops the snapshot without a partial apply.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), DecodeError> {
        debug!(target: "main", product_id = %snapshot.product_id, "processing incoming snapshot");

        let asks = parse_levels(&snapshot.asks)?;
        let bids = parse_levels(&snapshot.bids)?;

        let book = self
            .products
            .entry(snapshot.product_id.clone())
            .or_default();

        set_levels(&mut book.asks, asks);
        set_levels(&mut book.bids, bids);
        Ok(())
    }

    /// Apply an incremental update. A size at or below [`MIN_LEVEL_SIZE`]
    /// removes the level; otherwise the size is added to the existing level,
    /// inserting it when absent.
    pub fn apply_update(&mut self, update: &Update) -> Result<(), DecodeError> {
        debug!(target: "main", product_id = %update.product_id, "processing incoming update");

        let mut changes = Vec::with_capacity(update.changes.len());
        for (side, price, size) in &update.changes {
            changes.push((
                *side,
                parse_field("price", price)?,
                parse_field("size", size)?,
            ));
        }

        let book = self.products.entry(update.product_id.clone()).or_default();

        for (side, price, size) in changes {
            let levels = match side {
                Side::Buy => &mut book.bids,
                Side::Sell => &mut book.asks,
            };

            if size <= MIN_LEVEL_SIZE {
                levels.remove(&OrderedFloat(price));
            } else {
                *levels.entry(OrderedFloat(price)).or_insert(0.0) += size;
            }
        }

        Ok(())
    }

    /// Write both sides of a product's book to the cache as
    /// `<product>-ASKS` / `<product>-BIDS` hashes of decimal strings.
    pub async fn materialize<C: Cache + ?Sized>(
        &self,
        product_id: &str,
        cache: &mut C,
    ) -> Result<(), CacheError> {
        debug!(target: "cache", product_id, "pushing orderbook to cache");

        let Some(book) = self.products.get(product_id) else {
            return Ok(());
        };

        cache
            .hmset(&format!("{product_id}-ASKS"), &level_pairs(&book.asks))
            .await?;
        cache
            .hmset(&format!("{product_id}-BIDS"), &level_pairs(&book.bids))
            .await?;
        Ok(())
    }
}

fn set_levels(levels: &mut PriceLevels, parsed: Vec<(f64, f64)>) {
    for (price, size) in parsed {
        if size <= MIN_LEVEL_SIZE {
            levels.remove(&OrderedFloat(price));
        } else {
            levels.insert(OrderedFloat(price), size);
        }
    }
}

fn parse_levels(levels: &[(String, String)]) -> Result<Vec<(f64, f64)>, DecodeError> {
    levels
        .iter()
        .map(|(price, size)| Ok((parse_field("price", price)?, parse_field("size", size)?)))
        .collect()
}

fn parse_field(field: &'static str, value: &str) -> Result<f64, DecodeError> {
    let parsed = value.trim().parse::<f64>().map_err(|_| DecodeError::BadNumber {
        field,
        value: value.to_string(),
    })?;

    if !parsed.is_finite() {
        return Err(DecodeError::BadNumber {
            field,
            value: value.to_string(),
        });
    }

    Ok(parsed)
}

/// Prices and sizes are rendered with a fixed six decimal places, the
/// format downstream cache consumers already parse.
pub fn level_pairs(levels: &PriceLevels) -> Vec<(String, String)> {
    levels
        .iter()
        .map(|(price, size)| (format!("{:.6}", price.0), format!("{size:.6}")))
        .collect()
}
