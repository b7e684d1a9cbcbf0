use tracing::trace;
use url::Url;

use crate::errors::ConfigError;

/// Canonicalize an endpoint URL: lowercase scheme and host, elide default
/// ports, normalize percent-encoding. Malformed input is a recoverable
/// error surfaced to the caller.
pub fn normalize_url(input: &str) -> Result<String, ConfigError> {
    let trimmed = input.trim();

    let parsed = Url::parse(trimmed).map_err(|err| ConfigError::InvalidUrl {
        url: trimmed.to_string(),
        reason: err.to_string(),
    })?;

    if !parsed.has_host() {
        return Err(ConfigError::InvalidUrl {
            url: trimmed.to_string(),
            reason: "missing host".to_string(),
        });
    }

    let normalized = parsed.to_string();
    trace!(target: "web", url = input, normalized = %normalized, "normalized url");
    Ok(normalized)
}
