//! Per-user limits on how fast a server relays bytes back to its clients.
//!
//! Each user gets one [`TokenBucket`] shared by all of their streams, refilled continuously at the
//! configured rate and holding at most one second worth of bytes.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// The entry applied to users without one of their own.
pub const ANY_USER: &str = "*";

pub struct TokenBucket {
    bytes_per_sec: u64,
    state: Mutex<BucketState>,
}

struct BucketState {
    available: f64,
    updated: Instant,
}

impl TokenBucket {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            state: Mutex::new(BucketState {
                available: bytes_per_sec as f64,
                updated: Instant::now(),
            }),
        }
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    /// Takes `count` bytes out of the bucket, going into debt if there aren't enough, and returns
    /// how long the caller has to wait for the debt to be paid off.
    fn take(&self, count: usize) -> Duration {
        let rate = self.bytes_per_sec as f64;
        let mut state = self.state.lock();

        let now = Instant::now();
        let refill = now.duration_since(state.updated).as_secs_f64() * rate;
        state.available = (state.available + refill).min(rate);
        state.updated = now;
        state.available -= count as f64;

        match state.available < 0.0 {
            true => Duration::from_secs_f64(-state.available / rate),
            false => Duration::ZERO,
        }
    }

    /// Waits until `count` bytes may pass.
    pub async fn consume(&self, count: usize) {
        let wait = self.take(count);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// The configured limits and the buckets handed out so far.
pub struct UserRateLimits {
    limits: HashMap<String, u64>,
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl UserRateLimits {
    /// Builds the limits from `user -> size` entries, skipping (with a warning) sizes that don't
    /// parse. A zero size means no limit.
    pub fn new(config: &HashMap<String, String>) -> Self {
        let mut limits = HashMap::with_capacity(config.len());
        for (user, value) in config {
            match parse_byte_size(value) {
                Some(bytes_per_sec) => {
                    limits.insert(user.clone(), bytes_per_sec);
                }
                None => warn!("Invalid rate limit {value} for user {user}"),
            }
        }

        Self {
            limits,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// The bucket shared by every stream of `user`, or `None` if the user is unlimited.
    pub fn bucket_for(&self, user: &str) -> Option<Arc<TokenBucket>> {
        let bytes_per_sec = *self.limits.get(user).or_else(|| self.limits.get(ANY_USER))?;
        if bytes_per_sec == 0 {
            return None;
        }

        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(user.to_string()).or_insert_with(|| {
            debug!("Limiting user {user} to {bytes_per_sec} bytes per second");
            Arc::new(TokenBucket::new(bytes_per_sec))
        });

        Some(Arc::clone(bucket))
    }
}

/// Parses sizes such as `800`, `512K`, `1.5M` or `2GB`. Units are powers of 1024 and case doesn't
/// matter.
pub fn parse_byte_size(value: &str) -> Option<u64> {
    let value = value.trim().to_ascii_uppercase();
    let value = value.strip_suffix('B').unwrap_or(&value);

    let (number, multiplier) = match value.as_bytes().last()? {
        b'K' => (&value[..value.len() - 1], 1u64 << 10),
        b'M' => (&value[..value.len() - 1], 1 << 20),
        b'G' => (&value[..value.len() - 1], 1 << 30),
        _ => (value, 1),
    };

    let number: f64 = number.trim().parse().ok()?;
    match number.is_finite() && number >= 0.0 {
        true => Some((number * multiplier as f64) as u64),
        false => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("800"), Some(800));
        assert_eq!(parse_byte_size("512K"), Some(512 * 1024));
        assert_eq!(parse_byte_size("512kb"), Some(512 * 1024));
        assert_eq!(parse_byte_size("1.5M"), Some(1536 * 1024));
        assert_eq!(parse_byte_size(" 2GB "), Some(2 << 30));
        assert_eq!(parse_byte_size("0"), Some(0));
        assert_eq!(parse_byte_size(""), None);
        assert_eq!(parse_byte_size("fast"), None);
        assert_eq!(parse_byte_size("-1K"), None);
    }

    #[test]
    fn test_user_limits_fall_back_to_any_user() {
        let config = HashMap::from([
            ("alice".to_string(), "1M".to_string()),
            ("*".to_string(), "64K".to_string()),
            ("bob".to_string(), "0".to_string()),
            ("carol".to_string(), "lots".to_string()),
        ]);
        let limits = UserRateLimits::new(&config);

        assert_eq!(limits.bucket_for("alice").map(|b| b.bytes_per_sec()), Some(1 << 20));
        assert_eq!(limits.bucket_for("dave").map(|b| b.bytes_per_sec()), Some(64 << 10));
        assert_eq!(limits.bucket_for("carol").map(|b| b.bytes_per_sec()), Some(64 << 10));

        // An explicit zero exempts bob from the shared entry.
        assert!(limits.bucket_for("bob").is_none());

        let first = limits.bucket_for("alice").unwrap();
        let second = limits.bucket_for("alice").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        assert!(UserRateLimits::new(&HashMap::new()).bucket_for("alice").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_paces_consumers() {
        let bucket = TokenBucket::new(1000);
        let start = Instant::now();

        // A full bucket lets the first second worth of bytes through at once.
        bucket.consume(1000).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        bucket.consume(500).await;
        assert!(start.elapsed() >= Duration::from_millis(500));

        bucket.consume(2000).await;
        assert!(start.elapsed() >= Duration::from_millis(2500));
        assert!(start.elapsed() < Duration::from_millis(2600));
    }
}
