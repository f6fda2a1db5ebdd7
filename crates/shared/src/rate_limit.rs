//! Fixed-window rate limiting keyed by client identifier + action.
//!
//! The in-memory backend keeps one window per key and relies on
//! [`RateLimiter::spawn_sweeper`] to evict expired windows, so the map stays
//! bounded by the number of clients active within one window. Multi-instance
//! deployments use the Redis backend, where each window is a counter key with
//! a TTL and eviction is Redis' job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Limit for one action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    pub const fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    /// Seconds until the current window closes (only set when rejected)
    pub retry_after_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    expires_at: Instant,
}

#[derive(Clone)]
enum Backend {
    InMemory(Arc<Mutex<HashMap<String, Window>>>),
    Redis(ConnectionManager),
}

/// Process-wide rate limiter, cheap to clone
#[derive(Clone)]
pub struct RateLimiter {
    backend: Backend,
}

impl RateLimiter {
    pub fn new_in_memory() -> Self {
        Self {
            backend: Backend::InMemory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    /// Connect to a Redis fixed-window counter service
    pub async fn from_redis_url(url: &str) -> Result<Self, RateLimitError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            backend: Backend::Redis(manager),
        })
    }

    fn key(client_id: &str, action: &str) -> String {
        format!("{}:{}", action, client_id)
    }

    /// Count one request for `client_id` performing `action`
    pub async fn check(
        &self,
        client_id: &str,
        action: &str,
        config: RateLimitConfig,
    ) -> Result<RateLimitResult, RateLimitError> {
        match &self.backend {
            Backend::InMemory(windows) => {
                Ok(Self::check_in_memory(windows, Self::key(client_id, action), config).await)
            }
            Backend::Redis(manager) => {
                Self::check_redis(manager.clone(), &Self::key(client_id, action), config).await
            }
        }
    }

    async fn check_in_memory(
        windows: &Mutex<HashMap<String, Window>>,
        key: String,
        config: RateLimitConfig,
    ) -> RateLimitResult {
        let now = Instant::now();
        let mut windows = windows.lock().await;

        let window = windows.entry(key).or_insert(Window {
            count: 0,
            expires_at: now + config.window,
        });

        if window.expires_at <= now {
            *window = Window {
                count: 0,
                expires_at: now + config.window,
            };
        }

        if window.count >= config.max_requests {
            let retry_after = window.expires_at.saturating_duration_since(now);
            return RateLimitResult {
                allowed: false,
                remaining: 0,
                retry_after_seconds: Some(retry_after.as_secs().max(1)),
            };
        }

        window.count += 1;
        RateLimitResult {
            allowed: true,
            remaining: config.max_requests - window.count,
            retry_after_seconds: None,
        }
    }

    async fn check_redis(
        mut conn: ConnectionManager,
        key: &str,
        config: RateLimitConfig,
    ) -> Result<RateLimitResult, RateLimitError> {
        let window_secs = config.window.as_secs().max(1);
        let now_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let window_index = now_secs / window_secs;
        let redis_key = format!("ratelimit:{}:{}", key, window_index);

        let (count,): (u32,) = redis::pipe()
            .atomic()
            .incr(&redis_key, 1)
            .expire(&redis_key, window_secs as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;

        if count > config.max_requests {
            return Ok(RateLimitResult {
                allowed: false,
                remaining: 0,
                retry_after_seconds: Some((window_secs - now_secs % window_secs).max(1)),
            });
        }

        Ok(RateLimitResult {
            allowed: true,
            remaining: config.max_requests - count,
            retry_after_seconds: None,
        })
    }

    /// Drop windows whose TTL has passed. Returns how many were evicted.
    pub async fn sweep_expired(&self) -> usize {
        match &self.backend {
            Backend::InMemory(windows) => {
                let now = Instant::now();
                let mut windows = windows.lock().await;
                let before = windows.len();
                windows.retain(|_, w| w.expires_at > now);
                before - windows.len()
            }
            Backend::Redis(_) => 0,
        }
    }

    /// Number of live windows (in-memory backend only)
    pub async fn tracked_keys(&self) -> usize {
        match &self.backend {
            Backend::InMemory(windows) => windows.lock().await.len(),
            Backend::Redis(_) => 0,
        }
    }

    /// Start the background eviction task
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let evicted = limiter.sweep_expired().await;
                if evicted > 0 {
                    tracing::debug!(evicted, "Evicted expired rate limit windows");
                }
            }
        })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new_in_memory()
    }
}
