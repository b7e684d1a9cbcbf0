//! End-to-end data path: raw feed bytes through the processor into the
//! cache double.

mod common;

use std::collections::HashMap;

use common::RecordingCache;
use procyon::DataProcessor;
use serde_json::Value;
use tokio::time::Duration;

fn parsed_hash(cache_hash: &HashMap<String, String>) -> HashMap<String, f64> {
    cache_hash
        .iter()
        .map(|(price, size)| {
            (
                price.clone(),
                size.parse::<f64>().expect("size should be numeric"),
            )
        })
        .collect()
}

#[tokio::test]
async fn snapshot_then_update_materializes_expected_book() {
    let mut processor = DataProcessor::new(RecordingCache::new());

    let snapshot = br#"{
        "type": "snapshot",
        "product_id": "ETH-USD",
        "bids": [["100.0", "1.0"], ["99.5", "2.0"]],
        "asks": [["101.0", "1.5"]]
    }"#;
    processor.process_incoming_data(snapshot).await;

    let update = br#"{
        "type": "l2update",
        "product_id": "ETH-USD",
        "changes": [["BUY", "100.0", "0.5"], ["SELL", "101.0", "0"]]
    }"#;
    processor.process_incoming_data(update).await;

    let cache = processor.cache();

    let bids = parsed_hash(cache.hash("ETH-USD-BIDS").expect("bids should be written"));
    assert_eq!(bids.len(), 2);
    assert_eq!(bids.get("100.000000"), Some(&1.5));
    assert_eq!(bids.get("99.500000"), Some(&2.0));

    let asks = cache.hash("ETH-USD-ASKS").expect("asks should be written");
    assert!(asks.is_empty());
}

#[tokio::test]
async fn snapshot_alone_round_trips_into_the_cache() {
    let mut processor = DataProcessor::new(RecordingCache::new());

    let snapshot = br#"{
        "type": "snapshot",
        "product_id": "BTC-USD",
        "bids": [["50000.25", "0.75"]],
        "asks": [["50001.5", "1.25"]]
    }"#;
    processor.process_incoming_data(snapshot).await;

    let cache = processor.cache();

    let bids = parsed_hash(cache.hash("BTC-USD-BIDS").expect("bids should be written"));
    assert_eq!(bids.get("50000.250000"), Some(&0.75));

    let asks = parsed_hash(cache.hash("BTC-USD-ASKS").expect("asks should be written"));
    assert_eq!(asks.get("50001.500000"), Some(&1.25));
}

#[tokio::test(start_paused = true)]
async fn matches_publish_a_rolling_window() {
    let mut processor = DataProcessor::new(RecordingCache::new());

    let matched = |trade_id: i64| {
        format!(
            r#"{{
                "type": "match",
                "time": "2024-03-01T10:00:00.000000Z",
                "trade_id": {trade_id},
                "maker_order_id": "maker",
                "taker_order_id": "taker",
                "side": "BUY",
                "size": "1.0",
                "price": "100.0",
                "product_id": "ETH-USD",
                "sequence": {trade_id}
            }}"#
        )
    };

    processor.process_incoming_data(matched(1).as_bytes()).await;
    tokio::time::advance(Duration::from_millis(400)).await;
    processor.process_incoming_data(matched(2).as_bytes()).await;
    tokio::time::advance(Duration::from_millis(500)).await;
    processor.process_incoming_data(matched(3).as_bytes()).await;

    let published: Value = serde_json::from_str(
        processor
            .cache()
            .strings
            .get("matches")
            .expect("matches should be written"),
    )
    .expect("matches should be json");

    let rows = published.as_array().expect("matches should be an array");
    assert_eq!(rows.len(), 3);

    tokio::time::advance(Duration::from_millis(300)).await;
    processor.process_incoming_data(matched(4).as_bytes()).await;

    let published: Value = serde_json::from_str(
        processor
            .cache()
            .strings
            .get("matches")
            .expect("matches should be written"),
    )
    .expect("matches should be json");

    let rows = published.as_array().expect("matches should be an array");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["trade_id"], Value::from(4));
}

#[tokio::test]
async fn undecodable_messages_are_dropped_without_cache_writes() {
    let mut processor = DataProcessor::new(RecordingCache::new());

    processor.process_incoming_data(b"{malformed").await;
    processor
        .process_incoming_data(br#"{"type": "subscriptions", "channels": []}"#)
        .await;
    processor.process_incoming_data(&[0xFF, 0xFE, 0x00]).await;

    let cache = processor.cache();
    assert_eq!(cache.set_calls, 0);
    assert_eq!(cache.hmset_calls, 0);
    assert!(processor.book().is_empty());
}

#[tokio::test]
async fn cache_failures_do_not_stop_the_book() {
    let mut processor = DataProcessor::new(RecordingCache {
        fail: true,
        ..RecordingCache::new()
    });

    let update = br#"{
        "type": "l2update",
        "product_id": "ETH-USD",
        "changes": [["BUY", "100.0", "1.0"]]
    }"#;
    processor.process_incoming_data(update).await;

    assert_eq!(processor.cache().hmset_calls, 1);
    let product = processor
        .book()
        .product("ETH-USD")
        .expect("book should still apply");
    assert_eq!(product.bids.len(), 1);
}

#[tokio::test]
async fn mixed_products_keep_separate_cache_keys() {
    let mut processor = DataProcessor::new(RecordingCache::new());

    processor
        .process_incoming_data(
            br#"{"type": "l2update", "product_id": "ETH-USD", "changes": [["BUY", "100.0", "1.0"]]}"#,
        )
        .await;
    processor
        .process_incoming_data(
            br#"{"type": "l2update", "product_id": "BTC-USD", "changes": [["SELL", "50000.0", "0.5"]]}"#,
        )
        .await;

    let cache = processor.cache();
    assert!(cache.hash("ETH-USD-BIDS").is_some());
    assert!(cache.hash("BTC-USD-ASKS").is_some());
    assert!(cache.hash("BTC-USD-BIDS").expect("written").is_empty());
}
