//! The whole acquisition path over a real socket: greeting, subscribe,
//! market data into the book and trade window, state into the cache.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::RecordingCache;
use futures_util::{SinkExt, StreamExt};
use procyon::net::DataCallback;
use procyon::{DataProcessor, Session, SessionStatus};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

const GREETING: &str = "feed-proxy: connected";

const SNAPSHOT: &str = r#"{
    "type": "snapshot",
    "product_id": "ETH-USD",
    "bids": [["100.0", "1.0"], ["99.5", "2.0"]],
    "asks": [["101.0", "1.5"]]
}"#;

const UPDATE: &str = r#"{
    "type": "l2update",
    "product_id": "ETH-USD",
    "changes": [["BUY", "100.0", "0.5"], ["SELL", "101.0", "0"]]
}"#;

const MATCH: &str = r#"{
    "type": "match",
    "time": "2024-03-01T10:00:00.000000Z",
    "trade_id": 86,
    "maker_order_id": "maker",
    "taker_order_id": "taker",
    "side": "SELL",
    "size": "5.23512",
    "price": "400.23",
    "product_id": "ETH-USD",
    "sequence": 50
}"#;

#[tokio::test]
async fn greeting_subscribe_and_market_data_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let (subscribe_tx, subscribe_rx) = oneshot::channel::<Value>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("handshake");

        // Greet first; market data only flows once the client subscribes.
        ws.send(Message::Text(GREETING.to_string().into()))
            .await
            .expect("server send");

        let mut subscribe_tx = Some(subscribe_tx);
        while let Some(Ok(message)) = ws.next().await {
            match message {
                Message::Text(text) => {
                    let request: Value =
                        serde_json::from_str(text.as_str()).expect("subscribe should be json");
                    if let Some(tx) = subscribe_tx.take() {
                        let _ = tx.send(request);
                    }

                    for payload in [SNAPSHOT, UPDATE, MATCH, "done"] {
                        ws.send(Message::Text(payload.to_string().into()))
                            .await
                            .expect("server send");
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    let processor = Arc::new(Mutex::new(DataProcessor::new(RecordingCache::new())));
    let greeted = Arc::new(AtomicBool::new(false));

    let subscribe = serde_json::json!({
        "type": "subscribe",
        "channels": [
            { "name": "matches", "product_ids": ["ETH-USD"] },
            { "name": "level2_batch", "product_ids": ["ETH-USD"] },
        ]
    })
    .to_string();

    let on_data: DataCallback = {
        let processor = Arc::clone(&processor);
        Box::new(move |conn, data| {
            let processor = Arc::clone(&processor);
            let greeted = Arc::clone(&greeted);
            let subscribe = subscribe.clone();

            Box::pin(async move {
                if !greeted.swap(true, Ordering::SeqCst) {
                    assert_eq!(data.as_slice(), GREETING.as_bytes());
                    conn.send(subscribe.into_bytes());
                    return;
                }

                if data.as_slice() == b"done" {
                    conn.close();
                    return;
                }

                processor.lock().await.process_incoming_data(&data).await;
            })
        })
    };

    let mut session = Session::new();
    session
        .ws(&format!("ws://{addr}"), on_data)
        .expect("ws should queue");

    let status = session.run().await;
    assert_eq!(status, SessionStatus::Ok);
    assert!(!session.interrupted());

    let request = subscribe_rx.await.expect("server saw the subscription");
    assert_eq!(request["type"], "subscribe");
    assert_eq!(request["channels"][1]["name"], "level2_batch");

    let processor = processor.lock().await;
    let cache = processor.cache();

    let bids = cache.hash("ETH-USD-BIDS").expect("bids should be written");
    assert_eq!(bids.get("100.000000").map(String::as_str), Some("1.500000"));
    assert_eq!(bids.get("99.500000").map(String::as_str), Some("2.000000"));

    let asks = cache.hash("ETH-USD-ASKS").expect("asks should be written");
    assert!(asks.is_empty());

    let matches: Value = serde_json::from_str(
        cache
            .strings
            .get("matches")
            .expect("matches should be written"),
    )
    .expect("matches should be json");
    assert_eq!(matches[0]["trade_id"], Value::from(86));
    assert_eq!(matches[0]["size"], "5.23512");

    assert_eq!(processor.window().matches().len(), 1);
}
