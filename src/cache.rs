//! Cache adapter: a thin argv-style command surface over an injected
//! connection. Writes are best effort; callers log failures and move on.

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::errors::CacheError;

/// The two commands the data path needs. Implemented by the real client and
/// by test doubles.
#[async_trait]
pub trait Cache: Send {
    async fn set(&mut self, key: &str, value: &str) -> Result<(), CacheError>;

    /// Replace the hash at `key` with the given field/value pairs.
    async fn hmset(&mut self, key: &str, pairs: &[(String, String)]) -> Result<(), CacheError>;
}

pub struct RedisCache {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisCache {
    pub async fn connect(host: &str, port: u16) -> Result<Self, CacheError> {
        let client = redis::Client::open(format!("redis://{host}:{port}"))?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn set(&mut self, key: &str, value: &str) -> Result<(), CacheError> {
        trace!(target: "cache", key, bytes = value.len(), "SET");
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn hmset(&mut self, key: &str, pairs: &[(String, String)]) -> Result<(), CacheError> {
        trace!(target: "cache", key, fields = pairs.len(), "HMSET");

        // HMSET merges and rejects an empty field list, so stale fields are
        // dropped with a DEL in the same pipeline.
        let mut pipeline = redis::pipe();
        pipeline.cmd("DEL").arg(key).ignore();

        if pairs.is_empty() {
            debug!(target: "cache", key, "clearing empty hash");
        } else {
            let command = pipeline.cmd("HMSET").arg(key);
            for (field, value) in pairs {
                command.arg(field).arg(value);
            }
            command.ignore();
        }

        pipeline.query_async::<_, ()>(&mut self.conn).await?;
        Ok(())
    }
}
