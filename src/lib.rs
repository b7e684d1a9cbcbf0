//! Market-data acquisition: long-lived websocket feeds decoded into typed
//! events, folded into per-product L2 books and a rolling trade window, and
//! pushed to an external key-value cache.
//!
//! Everything runs on one thread: a single [`net::Session`] owns the event
//! loop and every connection, and the data path
//! (connection -> decoder -> book/trades -> cache) executes inline on it.

pub mod cache;
pub mod cli;
pub mod config;
pub mod errors;
pub mod events;
pub mod logging;
pub mod net;
pub mod orderbook;
pub mod processor;
pub mod trades;

pub use cache::{Cache, RedisCache};
pub use config::Config;
pub use errors::{CacheError, ConfigError, DecodeError};
pub use events::{decode, MarketEvent, Match, Side, Snapshot, Update};
pub use net::{
    DataCallback, FrameKind, RetryPolicy, Session, SessionStatus, WebSocketCloseCode,
    WebSocketConnection,
};
pub use orderbook::OrderBook;
pub use processor::DataProcessor;
pub use trades::TradeWindow;
