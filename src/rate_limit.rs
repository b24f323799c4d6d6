//! Role-aware fixed-window rate limiting backed by SQLite.
//!
//! Windows are aligned to the epoch: the window containing `now` starts at
//! `now - now % window_secs`. Each (actor, endpoint class, window start)
//! triple owns one counter row, and the check is a single atomic upsert so
//! concurrent requests can never both observe "one slot left" and both pass.
//!
//! A limiter backend failure fails open. Blocking every request because the
//! counter store is down is a worse outage than briefly not limiting.

use chrono::Utc;
use sqlx::SqlitePool;

use crate::config::RateLimitConfig;
use crate::models::RateDecision;

#[derive(Clone)]
pub struct RateLimiter {
    pool: SqlitePool,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(pool: SqlitePool, config: RateLimitConfig) -> Self {
        Self { pool, config }
    }

    /// Checks the actor's budget for one endpoint class and consumes a slot
    /// when allowed. The upsert is guarded on `count < limit`, so denials
    /// leave the counter untouched and the stored count never passes the
    /// limit.
    pub async fn check_and_consume(&self, actor: &str, class: &str, role: &str) -> RateDecision {
        self.check_and_consume_at(actor, class, role, Utc::now().timestamp())
            .await
    }

    pub async fn check_and_consume_at(
        &self,
        actor: &str,
        class: &str,
        role: &str,
        now: i64,
    ) -> RateDecision {
        let Some(window) = self.resolve(class, role) else {
            return unrestricted(now);
        };
        let window_start = now - now.rem_euclid(window.window_secs);
        let reset_at = window_start + window.window_secs;
        let denied = RateDecision {
            allowed: false,
            limit: window.limit,
            remaining: 0,
            reset_at,
            retry_after_secs: (reset_at - now).max(1),
        };
        if window.limit <= 0 {
            return denied;
        }
        let key = window_key(actor, class, window_start);

        let count: Result<Option<i64>, sqlx::Error> = sqlx::query_scalar(
            r#"
            INSERT INTO rate_windows (key, count, window_start, window_secs)
            VALUES (?, 1, ?, ?)
            ON CONFLICT(key) DO UPDATE SET count = count + 1
            WHERE rate_windows.count < ?
            RETURNING count
            "#,
        )
        .bind(&key)
        .bind(window_start)
        .bind(window.window_secs)
        .bind(window.limit)
        .fetch_optional(&self.pool)
        .await;

        match count {
            Ok(Some(count)) => RateDecision {
                allowed: true,
                limit: window.limit,
                remaining: window.limit - count,
                reset_at,
                retry_after_secs: 0,
            },
            // The guard rejected the update: the window is already full.
            Ok(None) => denied,
            Err(err) => {
                tracing::warn!(%err, actor, class, "rate limiter unavailable, failing open");
                RateDecision {
                    allowed: true,
                    limit: window.limit,
                    remaining: window.limit,
                    reset_at,
                    retry_after_secs: 0,
                }
            }
        }
    }

    /// Read-only view of the current window. Never consumes a slot.
    pub async fn peek(&self, actor: &str, class: &str, role: &str) -> RateDecision {
        self.peek_at(actor, class, role, Utc::now().timestamp())
            .await
    }

    pub async fn peek_at(&self, actor: &str, class: &str, role: &str, now: i64) -> RateDecision {
        let Some(window) = self.resolve(class, role) else {
            return unrestricted(now);
        };
        let window_start = now - now.rem_euclid(window.window_secs);
        let reset_at = window_start + window.window_secs;
        let key = window_key(actor, class, window_start);

        let count: i64 = sqlx::query_scalar("SELECT count FROM rate_windows WHERE key = ?")
            .bind(&key)
            .fetch_optional(&self.pool)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(%err, "rate limiter peek failed");
                None
            })
            .unwrap_or(0);

        let remaining = (window.limit - count).max(0);
        RateDecision {
            allowed: count < window.limit,
            limit: window.limit,
            remaining,
            reset_at,
            retry_after_secs: if count < window.limit {
                0
            } else {
                (reset_at - now).max(1)
            },
        }
    }

    /// Drops counter rows whose window has ended. Called periodically by the
    /// janitor task; stale rows are harmless, just dead weight.
    pub async fn prune(&self, now: i64) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM rate_windows WHERE window_start + window_secs <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    fn resolve(&self, class: &str, role: &str) -> Option<crate::config::WindowLimit> {
        if !self.config.enabled {
            return None;
        }
        self.config.lookup(class, role)
    }
}

fn window_key(actor: &str, class: &str, window_start: i64) -> String {
    format!("{actor}|{class}|{window_start}")
}

/// Decision for disabled limiting or an unconfigured endpoint class.
fn unrestricted(now: i64) -> RateDecision {
    RateDecision {
        allowed: true,
        limit: i64::MAX,
        remaining: i64::MAX,
        reset_at: now,
        retry_after_secs: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_memory;
    use crate::migrate::run_migrations;

    async fn limiter(config: RateLimitConfig) -> RateLimiter {
        let pool = connect_memory().await.unwrap();
        run_migrations(&pool).await.unwrap();
        RateLimiter::new(pool, config)
    }

    #[tokio::test]
    async fn test_denies_at_limit_then_resets_next_window() {
        let rl = limiter(RateLimitConfig::default()).await;
        // query/basic: 100 per 900s window starting at t=0
        for i in 0..100 {
            let d = rl.check_and_consume_at("alice", "query", "basic", 10).await;
            assert!(d.allowed, "request {} should pass", i + 1);
        }
        let denied = rl.check_and_consume_at("alice", "query", "basic", 10).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at, 900);
        assert_eq!(denied.retry_after_secs, 890);

        // Fresh window, fresh budget
        let next = rl.check_and_consume_at("alice", "query", "basic", 900).await;
        assert!(next.allowed);
        assert_eq!(next.remaining, 99);
    }

    #[tokio::test]
    async fn test_denials_leave_the_counter_at_the_limit() {
        let pool = connect_memory().await.unwrap();
        run_migrations(&pool).await.unwrap();
        let rl = RateLimiter::new(pool.clone(), RateLimitConfig::default());
        for _ in 0..100 {
            assert!(
                rl.check_and_consume_at("alice", "query", "basic", 10)
                    .await
                    .allowed
            );
        }
        for _ in 0..5 {
            let d = rl.check_and_consume_at("alice", "query", "basic", 10).await;
            assert!(!d.allowed);
            assert_eq!(d.retry_after_secs, 890);
        }
        let stored: i64 = sqlx::query_scalar("SELECT count FROM rate_windows WHERE key = ?")
            .bind("alice|query|0")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(stored, 100);
    }

    #[tokio::test]
    async fn test_actors_and_classes_are_independent() {
        let rl = limiter(RateLimitConfig::default()).await;
        // upload/basic: 20 per hour
        for _ in 0..20 {
            assert!(
                rl.check_and_consume_at("alice", "upload", "basic", 10)
                    .await
                    .allowed
            );
        }
        assert!(
            !rl.check_and_consume_at("alice", "upload", "basic", 10)
                .await
                .allowed
        );
        // Exhausting uploads spends nothing from alice's queries or bob's uploads
        assert!(
            rl.check_and_consume_at("alice", "query", "basic", 10)
                .await
                .allowed
        );
        assert!(
            rl.check_and_consume_at("bob", "upload", "basic", 10)
                .await
                .allowed
        );
    }

    #[tokio::test]
    async fn test_role_selects_its_own_limit() {
        let rl = limiter(RateLimitConfig::default()).await;
        let d = rl
            .check_and_consume_at("inst", "query", "institutional", 10)
            .await;
        assert_eq!(d.limit, 1000);
        assert_eq!(d.remaining, 999);
        // Unknown role falls back to basic
        let d = rl.check_and_consume_at("x", "query", "guest", 10).await;
        assert_eq!(d.limit, 100);
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let rl = limiter(RateLimitConfig::default()).await;
        rl.check_and_consume_at("alice", "query", "basic", 10).await;
        for _ in 0..5 {
            let d = rl.peek_at("alice", "query", "basic", 10).await;
            assert_eq!(d.remaining, 99);
        }
        let d = rl.check_and_consume_at("alice", "query", "basic", 10).await;
        assert_eq!(d.remaining, 98);
    }

    #[tokio::test]
    async fn test_disabled_limiter_allows_everything() {
        let config = RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        };
        let rl = limiter(config).await;
        for _ in 0..500 {
            assert!(
                rl.check_and_consume_at("alice", "query", "basic", 10)
                    .await
                    .allowed
            );
        }
    }

    #[tokio::test]
    async fn test_prune_removes_only_ended_windows() {
        let rl = limiter(RateLimitConfig::default()).await;
        rl.check_and_consume_at("alice", "query", "basic", 10).await; // window [0,900)
        rl.check_and_consume_at("alice", "query", "basic", 950).await; // window [900,1800)
        let removed = rl.prune(900).await.unwrap();
        assert_eq!(removed, 1);
        // Surviving window still counts
        let d = rl.peek_at("alice", "query", "basic", 960).await;
        assert_eq!(d.remaining, 99);
    }
}
