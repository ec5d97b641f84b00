//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default maximum nesting depth accepted in literal payloads.
pub const DEFAULT_MAX_LITERAL_DEPTH: usize = 64;

/// Default number of attempts for repeatable transactions.
pub const DEFAULT_MAX_TRANSACTION_ATTEMPTS: usize = 10;

/// Default base delay between transaction retries.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(5);

/// Default number of read-modify-replace attempts for triggered writes.
pub const DEFAULT_WRITE_RETRY_LIMIT: usize = 8;

/// Default batch size for `each_batch`.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Files larger than this are offloaded to the file store.
pub const DEFAULT_INLINE_FILE_THRESHOLD: usize = 16 * 1024;

/// Configuration for the query engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Master key accepted for bypass. `None` disables master access.
    pub master_key: Option<String>,

    /// Maximum nesting depth for filter/update literals.
    pub max_literal_depth: usize,

    /// Attempts made by repeatable transactions before surfacing a conflict.
    pub max_transaction_attempts: usize,

    /// Base delay between transaction retries, multiplied by the attempt number.
    pub retry_backoff: Duration,

    /// Attempts for version-guarded writes that run through triggers.
    pub write_retry_limit: usize,

    /// Batch size used when a batch size is not supplied.
    pub default_batch_size: usize,

    /// Inline size limit for file attributes.
    pub inline_file_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            master_key: None,
            max_literal_depth: DEFAULT_MAX_LITERAL_DEPTH,
            max_transaction_attempts: DEFAULT_MAX_TRANSACTION_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            write_retry_limit: DEFAULT_WRITE_RETRY_LIMIT,
            default_batch_size: DEFAULT_BATCH_SIZE,
            inline_file_threshold: DEFAULT_INLINE_FILE_THRESHOLD,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the master key.
    pub fn with_master_key(mut self, key: impl Into<String>) -> Self {
        self.master_key = Some(key.into());
        self
    }

    /// Set the literal depth limit.
    pub fn with_max_literal_depth(mut self, depth: usize) -> Self {
        self.max_literal_depth = depth;
        self
    }

    /// Set the repeatable transaction attempt limit.
    pub fn with_max_transaction_attempts(mut self, attempts: usize) -> Self {
        self.max_transaction_attempts = attempts.max(1);
        self
    }

    /// Set the retry backoff.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set the attempt limit for version-guarded writes.
    pub fn with_write_retry_limit(mut self, attempts: usize) -> Self {
        self.write_retry_limit = attempts.max(1);
        self
    }

    /// Set the default batch size.
    pub fn with_default_batch_size(mut self, size: usize) -> Self {
        self.default_batch_size = size.max(1);
        self
    }

    /// Set the inline file threshold.
    pub fn with_inline_file_threshold(mut self, bytes: usize) -> Self {
        self.inline_file_threshold = bytes;
        self
    }
}

/// Configuration for the sled backend.
#[derive(Debug, Clone)]
pub struct SledConfig {
    /// Path to the database directory.
    pub path: PathBuf,

    /// Page cache capacity in bytes.
    pub cache_capacity: u64,

    /// Enable zstd compression.
    pub compression: bool,

    /// Temporary database (deleted on drop).
    pub temporary: bool,
}

impl Default for SledConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./acldb_data"),
            cache_capacity: 256 * 1024 * 1024,
            compression: true,
            temporary: false,
        }
    }
}

impl SledConfig {
    /// Create a configuration for the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Create a temporary configuration for testing.
    pub fn temporary() -> Self {
        Self {
            path: PathBuf::from(""),
            temporary: true,
            ..Default::default()
        }
    }

    /// Convert to sled configuration.
    pub(crate) fn to_sled_config(&self) -> sled::Config {
        let config = sled::Config::new()
            .cache_capacity(self.cache_capacity)
            .use_compression(self.compression);

        if self.temporary {
            config.temporary(true)
        } else {
            config.path(&self.path)
        }
    }
}
