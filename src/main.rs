use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use procyon::cli::{self, ParseResult};
use procyon::net::DataCallback;
use procyon::{logging, Config, DataProcessor, RedisCache, Session, SessionStatus};

const NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = std::env::args().skip(1).collect::<Vec<_>>();

    let options = match cli::parse_args(&args) {
        Ok(ParseResult::Help) => {
            cli::print_usage();
            return ExitCode::SUCCESS;
        }
        Ok(ParseResult::Version) => {
            println!("{NAME} v{VERSION}");
            return ExitCode::SUCCESS;
        }
        Ok(ParseResult::Run(options)) => options,
        Err(message) => {
            eprintln!("{message}");
            eprintln!("{}", cli::USAGE);
            return ExitCode::FAILURE;
        }
    };

    logging::init(options.verbosity);
    info!(target: "main", "{NAME} v{VERSION}: market data acquisition");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(target: "main", error = %err, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let cache = match RedisCache::connect(&config.cache_host, config.cache_port).await {
        Ok(cache) => {
            info!(
                target: "cache",
                host = %config.cache_host,
                port = config.cache_port,
                "connected to cache"
            );
            cache
        }
        Err(err) => {
            error!(target: "cache", error = %err, "could not connect to cache");
            return ExitCode::FAILURE;
        }
    };

    let processor = Arc::new(Mutex::new(DataProcessor::new(cache)));

    let mut session = Session::new();
    if let Err(err) = session.ws(&config.feed_url, feed_callback(&config, processor)) {
        error!(target: "main", error = %err, "rejected feed url");
        return ExitCode::FAILURE;
    }

    match session.run().await {
        SessionStatus::ForcedShutdown => {
            error!(target: "main", "forced shutdown, aborting");
            std::process::abort();
        }
        SessionStatus::GracefulShutdown => {
            warn!(target: "main", "gracefully exiting application");
            ExitCode::SUCCESS
        }
        SessionStatus::Ok => {
            if session.interrupted() {
                error!(target: "main", "feed connection lost for good, aborting");
                std::process::abort();
            }
            ExitCode::SUCCESS
        }
    }
}

/// Data callback for the feed connection: the first frame is the endpoint
/// greeting and is answered with the subscribe payload; every later frame
/// is market data.
fn feed_callback<C>(config: &Config, processor: Arc<Mutex<DataProcessor<C>>>) -> DataCallback
where
    C: procyon::Cache + 'static,
{
    let subscribe = subscribe_payload(&config.products);
    let greeted = Arc::new(AtomicBool::new(false));

    Box::new(move |conn, data| {
        let processor = Arc::clone(&processor);
        let greeted = Arc::clone(&greeted);
        let subscribe = subscribe.clone();

        Box::pin(async move {
            if !greeted.swap(true, Ordering::SeqCst) {
                info!(target: "main", "feed greeting received, subscribing");
                conn.send(subscribe.into_bytes());
                return;
            }

            processor.lock().await.process_incoming_data(&data).await;
        })
    })
}

fn subscribe_payload(products: &[String]) -> String {
    json!({
        "type": "subscribe",
        "channels": [
            { "name": "matches", "product_ids": products },
            { "name": "level2_batch", "product_ids": products },
        ]
    })
    .to_string()
}
