use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::warn;

use crate::error::{AppError, AppResult};

pub const LOGIN_MAX_ATTEMPTS: u64 = 5;
pub const LOGIN_WINDOW_SECS: u64 = 15 * 60;

/// Redis key counting login attempts for one username.
pub fn login_key(username: &str) -> String {
    format!("rate_limit:login:{}", username.trim().to_lowercase())
}

/// Fixed-window attempt counter.
#[async_trait]
pub trait AttemptCounter: Send + Sync {
    /// Counts one attempt at `key` and returns the total inside the current window.
    async fn hit(&self, key: &str, window_secs: u64) -> anyhow::Result<u64>;
}

/// Counter stored in Redis (INCR, then EXPIRE on the first hit).
pub struct RedisAttemptCounter {
    conn: MultiplexedConnection,
}

impl RedisAttemptCounter {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl AttemptCounter for RedisAttemptCounter {
    async fn hit(&self, key: &str, window_secs: u64) -> anyhow::Result<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;

        if count == 1 {
            // Only the first hit sets the TTL so retries don't extend the window.
            let expire: redis::RedisResult<()> = redis::cmd("EXPIRE")
                .arg(key)
                .arg(window_secs)
                .query_async(&mut conn)
                .await;
            if let Err(e) = expire {
                warn!(error = %e, "could not set rate limit window");
            }
        }

        Ok(count)
    }
}

/// Rejects the attempt once `max_attempts` is exceeded inside the window.
///
/// Fails open: if the counter is unavailable the attempt is allowed and a
/// warning is logged.
pub async fn check_rate_limit(
    counter: &dyn AttemptCounter,
    key: &str,
    max_attempts: u64,
    window_secs: u64,
) -> AppResult<()> {
    match counter.hit(key, window_secs).await {
        Ok(count) => exceeded(count, max_attempts),
        Err(e) => {
            warn!(error = %e, "rate limit counter unavailable");
            Ok(())
        }
    }
}

fn exceeded(count: u64, max_attempts: u64) -> AppResult<()> {
    if count > max_attempts {
        Err(AppError::RateLimited)
    } else {
        Ok(())
    }
}
