//! Fixed-window counter stores for the rate limiter.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use tokio::time::Instant;

/// Key prefix for counters in a shared store.
const REDIS_PREFIX: &str = "listenstats:rl";

#[derive(Debug, Clone, thiserror::Error)]
pub enum RateStoreError {
    #[error("rate store backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for RateStoreError {
    fn from(e: redis::RedisError) -> Self {
        RateStoreError::Backend(e.to_string())
    }
}

/// Count after recording one hit, and time until the window rolls over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    pub resets_in: Duration,
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomically record one hit for `key` in its current window of length `window`.
    async fn hit(&self, key: &str, window: Duration) -> Result<WindowCount, RateStoreError>;

    /// Drop expired windows. Returns how many were removed.
    async fn sweep(&self) -> usize {
        0
    }

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    length: Duration,
    count: u64,
}

impl Window {
    fn ends(&self) -> Instant {
        self.started + self.length
    }
}

/// In-process counters. Only correct for a single instance.
#[derive(Debug, Default)]
pub struct MemoryRateStore {
    windows: DashMap<String, Window>,
}

impl MemoryRateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateStore {
    async fn hit(&self, key: &str, window: Duration) -> Result<WindowCount, RateStoreError> {
        let now = Instant::now();
        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            started: now,
            length: window,
            count: 0,
        });

        if now >= entry.ends() || entry.length != window {
            *entry = Window {
                started: now,
                length: window,
                count: 0,
            };
        }
        entry.count += 1;

        Ok(WindowCount {
            count: entry.count,
            resets_in: entry.ends().saturating_duration_since(now),
        })
    }

    async fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, w| now < w.ends());
        before.saturating_sub(self.windows.len())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Counters shared across instances through Redis.
///
/// Keys carry the window index, so each window starts from zero without a reset
/// race. `INCR` and `PEXPIRE` run in one `MULTI` transaction.
#[derive(Clone)]
pub struct RedisRateStore {
    conn: ConnectionManager,
}

impl RedisRateStore {
    pub async fn connect(url: &str) -> Result<Self, RateStoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Connected to Redis rate store");
        Ok(Self { conn })
    }
}

/// Window-indexed key and time until that window ends.
fn redis_window_key(key: &str, window: Duration, now: Duration) -> (String, Duration) {
    let window_ms = window.as_millis().max(1);
    let now_ms = now.as_millis();
    let index = now_ms / window_ms;
    let resets_in_ms = window_ms - (now_ms % window_ms);
    (
        format!("{REDIS_PREFIX}:{key}:{index}"),
        Duration::from_millis(resets_in_ms as u64),
    )
}

#[async_trait]
impl RateLimitStore for RedisRateStore {
    async fn hit(&self, key: &str, window: Duration) -> Result<WindowCount, RateStoreError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| RateStoreError::Backend(e.to_string()))?;
        let (redis_key, resets_in) = redis_window_key(key, window, now);

        let mut conn = self.conn.clone();
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .incr(&redis_key, 1u64)
            .pexpire(&redis_key, window.as_millis() as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(WindowCount { count, resets_in })
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
