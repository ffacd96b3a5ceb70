//! Environment configuration and trace enablement.

use std::env;
use std::sync::Once;

/// Environment variable naming the worker-thread count.
pub const POOL_SIZE_ENV: &str = "POOL_THREADPOOL_SIZE";
/// Environment variable enabling stderr tracing.
pub const TRACE_ENV: &str = "LIBDQLITE_TRACE";

pub const DEFAULT_POOL_SIZE: u32 = 4;
pub const MAX_POOL_SIZE: u32 = 1024;

/// Default budget, in 8-byte words, for one ROWS response chunk.
pub const DEFAULT_ROWS_BUFFER_WORDS: usize = 4096;

#[derive(Debug, Clone)]
pub struct Config {
    /// Worker threads in the pool, already clamped.
    pub pool_threads: u32,
    /// Whether stderr tracing is enabled.
    pub trace: bool,
    /// ROWS chunk budget in words.
    pub rows_buffer_words: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_threads: DEFAULT_POOL_SIZE,
            trace: false,
            rows_buffer_words: DEFAULT_ROWS_BUFFER_WORDS,
        }
    }
}

impl Config {
    /// Read the configuration from the environment.
    pub fn from_env() -> Self {
        let pool_threads = match env::var(POOL_SIZE_ENV) {
            Ok(v) => v
                .parse::<u32>()
                .map(clamp_pool_size)
                .unwrap_or(DEFAULT_POOL_SIZE),
            Err(_) => DEFAULT_POOL_SIZE,
        };
        let trace = env::var(TRACE_ENV)
            .map(|v| is_truthy(&v))
            .unwrap_or(false);
        Self {
            pool_threads,
            trace,
            rows_buffer_words: DEFAULT_ROWS_BUFFER_WORDS,
        }
    }
}

/// Clamp a requested pool size into [1, 1024]; zero becomes one.
pub fn clamp_pool_size(requested: u32) -> u32 {
    requested.clamp(1, MAX_POOL_SIZE)
}

fn is_truthy(value: &str) -> bool {
    !matches!(value, "" | "0" | "false" | "off" | "no")
}

/// Install the stderr trace subscriber once, if enabled.
///
/// Only written at startup; later calls are no-ops.
pub fn maybe_enable_tracing(enabled: bool) {
    static INIT: Once = Once::new();
    if !enabled {
        return;
    }
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_bounds() {
        assert_eq!(clamp_pool_size(0), 1);
        assert_eq!(clamp_pool_size(1), 1);
        assert_eq!(clamp_pool_size(4), 4);
        assert_eq!(clamp_pool_size(1024), 1024);
        assert_eq!(clamp_pool_size(10_000), 1024);
    }

    #[test]
    fn truthiness() {
        assert!(is_truthy("1"));
        assert!(is_truthy("true"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy("off"));
        assert!(!is_truthy(""));
    }

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.pool_threads, DEFAULT_POOL_SIZE);
        assert!(!c.trace);
    }
}
