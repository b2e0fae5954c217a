//! Environment variables read by the group message queue

use std::env;
use std::str::FromStr;

use anyhow::Context as _;

/// Master switch for processing the incoming group message queue
pub const GM_QUEUE_ENABLED_ENV: &str = "GM_QUEUE_ENABLED";

/// Whether group changes embedded in messages are applied locally
pub const GM_QUEUE_APPLY_EMBEDDED_CHANGES_ENV: &str = "GM_QUEUE_APPLY_EMBEDDED_CHANGES";

/// Number of jobs fetched per batch in the foreground
pub const GM_QUEUE_BATCH_SIZE_ENV: &str = "GM_QUEUE_BATCH_SIZE";

/// Pause between two consecutive batches, in milliseconds
pub const GM_QUEUE_BATCH_SPACING_MS_ENV: &str = "GM_QUEUE_BATCH_SPACING_MS";

/// Initial retry delay after a retryable failure, in milliseconds
pub const GM_QUEUE_RETRY_BASE_DELAY_MS_ENV: &str = "GM_QUEUE_RETRY_BASE_DELAY_MS";

/// RocksDB write buffer size in bytes, must be a power of two
pub const GM_ROCKSDB_WRITE_BUFFER_SIZE_ENV: &str = "GM_ROCKSDB_WRITE_BUFFER_SIZE";

/// Read and parse an env var, `None` if it is not set
pub fn parse_env_var<T>(var: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(var) {
        Ok(value) => Ok(Some(
            value
                .trim()
                .parse()
                .with_context(|| anyhow::anyhow!("failure parsing env var {var}"))?,
        )),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| anyhow::anyhow!("failure looking up env var {var}")),
    }
}
