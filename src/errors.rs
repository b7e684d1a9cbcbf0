use thiserror::Error;

/// Pre-run configuration failures. These surface to the CLI and exit the
/// process with status 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid {name} value `{value}`")]
    InvalidEnv { name: &'static str, value: String },
}

/// Failures decoding a feed message. The message is dropped and the
/// connection continues.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown event type `{0}`")]
    UnknownType(String),
    #[error("message matches no known event shape")]
    UnrecognizedShape,
    #[error("invalid numeric field `{field}`: `{value}`")]
    BadNumber { field: &'static str, value: String },
}

/// Failures talking to the key-value cache. The cache is best effort, so
/// callers log these and continue.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache command failed: {0}")]
    Command(#[from] redis::RedisError),
    #[error("could not serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}
