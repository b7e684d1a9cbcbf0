use anyhow::{bail, Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub cache_host: String,
    pub cache_port: u16,
    pub feed_url: String,
    pub products: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let cache_host = std::env::var("REDIS_URL")
            .unwrap_or_else(|_| "127.0.0.1".to_string())
            .trim()
            .to_string();

        let cache_port = match std::env::var("REDIS_PORT") {
            Ok(value) => value
                .trim()
                .parse::<u16>()
                .with_context(|| format!("invalid REDIS_PORT value: {value}"))?,
            Err(_) => 6379,
        };

        let feed_url = std::env::var("FEED_URL")
            .unwrap_or_else(|_| "ws://localhost:8675".to_string())
            .trim()
            .to_string();

        let products = std::env::var("PRODUCTS")
            .unwrap_or_else(|_| "ETH-USD".to_string())
            .split(',')
            .map(|product| product.trim().to_string())
            .filter(|product| !product.is_empty())
            .collect::<Vec<_>>();

        if products.is_empty() {
            bail!("PRODUCTS must name at least one product id");
        }

        Ok(Self {
            cache_host,
            cache_port,
            feed_url,
            products,
        })
    }
}
