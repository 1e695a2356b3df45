//! Resource throttling for osync
//!
//! Two process-wide limits are provided:
//!
//! 1. **Open Files Limit** - caps the number of local files held open at once (upload streams and
//!    checksum reads). Without it a high `--concurrency` can exhaust the descriptor table.
//! 2. **Request Throttle** - caps the number of remote store requests issued per second.
//!
//! Both are disabled until configured with a non-zero value, at which point acquiring a permit
//! or a token may park the calling task.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! # async fn example() {
//! throttle::set_max_open_files(1024);
//! throttle::init_request_tokens(20);
//! tokio::spawn(throttle::run_request_replenish(Duration::from_millis(100)));
//!
//! let _file_guard = throttle::open_file_permit().await;
//! throttle::request_token().await;
//! // open the file and issue the request here
//! # }
//! ```
//!
//! With 20 tokens replenished every 100ms the effective ceiling is 200 requests per second.

mod semaphore;

use semaphore::TokenGate;

static OPEN_FILES_LIMIT: TokenGate = TokenGate::new();
static REQUEST_THROTTLE: TokenGate = TokenGate::new();

/// Sets the maximum number of simultaneously open local files, 0 disables the limit.
pub fn set_max_open_files(max_open_files: usize) {
    OPEN_FILES_LIMIT.configure(max_open_files);
}

/// Holds one open-file slot until dropped.
pub struct OpenFileGuard {
    _permit: Option<tokio::sync::SemaphorePermit<'static>>,
}

pub async fn open_file_permit() -> OpenFileGuard {
    OpenFileGuard {
        _permit: OPEN_FILES_LIMIT.hold().await,
    }
}

/// Sets the number of remote requests allowed per replenish interval, 0 disables throttling.
pub fn init_request_tokens(tokens_per_interval: usize) {
    REQUEST_THROTTLE.configure(tokens_per_interval);
}

pub async fn request_token() {
    REQUEST_THROTTLE.take().await;
}

/// Background task refilling the request bucket; returns immediately if throttling is disabled.
pub async fn run_request_replenish(interval: std::time::Duration) {
    REQUEST_THROTTLE.refill_forever(interval).await;
}

/// Converts a requests-per-second target into `(tokens, interval)` for the replenish task.
///
/// Small rates use a longer interval so that at least one token is added per tick.
pub fn request_rate_to_tokens(per_second: usize) -> (usize, std::time::Duration) {
    if per_second >= 10 {
        (per_second / 10, std::time::Duration::from_millis(100))
    } else {
        (per_second, std::time::Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_conversion() {
        assert_eq!(
            request_rate_to_tokens(500),
            (50, std::time::Duration::from_millis(100))
        );
        assert_eq!(
            request_rate_to_tokens(3),
            (3, std::time::Duration::from_secs(1))
        );
        assert_eq!(
            request_rate_to_tokens(0),
            (0, std::time::Duration::from_secs(1))
        );
    }
}
