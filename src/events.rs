//! Feed message decoding.
//!
//! One exchange dialect, isolated here: level-2 snapshots, level-2 updates
//! and trade matches arrive as JSON text frames. Numeric prices and sizes
//! stay strings at this layer; the book parses them on apply.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY", alias = "buy")]
    Buy,
    #[serde(rename = "SELL", alias = "sell")]
    Sell,
}

/// Absolute state for the listed price levels of one product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub time: String,
    pub product_id: String,
    #[serde(default)]
    pub asks: Vec<(String, String)>,
    #[serde(default)]
    pub bids: Vec<(String, String)>,
}

/// Incremental per-side, per-price changes. A zero size removes the level;
/// a nonzero size is a delta on top of whatever the book holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    #[serde(default)]
    pub time: String,
    pub product_id: String,
    pub changes: Vec<(Side, String, String)>,
}

/// An executed trade record, carried through to the cache verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    #[serde(default)]
    pub time: String,
    pub trade_id: i64,
    pub maker_order_id: String,
    pub taker_order_id: String,
    pub side: Side,
    pub size: String,
    pub price: String,
    pub product_id: String,
    pub sequence: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Snapshot(Snapshot),
    Update(Update),
    Match(Match),
}

impl MarketEvent {
    pub fn product_id(&self) -> &str {
        match self {
            MarketEvent::Snapshot(snapshot) => &snapshot.product_id,
            MarketEvent::Update(update) => &update.product_id,
            MarketEvent::Match(matched) => &matched.product_id,
        }
    }
}

/// Decode one complete text frame into a market event.
///
/// Discrimination is by the `type` field when present, otherwise by which
/// distinguishing fields the object carries. Stateless and pure.
pub fn decode(payload: &str) -> Result<MarketEvent, DecodeError> {
    let value: Value = serde_json::from_str(payload)?;
    let kind = value.get("type").and_then(Value::as_str).map(str::to_owned);

    match kind.as_deref() {
        Some("snapshot") => Ok(MarketEvent::Snapshot(serde_json::from_value(value)?)),
        Some("l2update") => Ok(MarketEvent::Update(serde_json::from_value(value)?)),
        Some("match" | "last_match") => Ok(MarketEvent::Match(serde_json::from_value(value)?)),
        Some(other) => Err(DecodeError::UnknownType(other.to_string())),
        None if value.get("changes").is_some() => {
            Ok(MarketEvent::Update(serde_json::from_value(value)?))
        }
        None if value.get("asks").is_some() || value.get("bids").is_some() => {
            Ok(MarketEvent::Snapshot(serde_json::from_value(value)?))
        }
        None if value.get("trade_id").is_some() => {
            Ok(MarketEvent::Match(serde_json::from_value(value)?))
        }
        None => Err(DecodeError::UnrecognizedShape),
    }
}
