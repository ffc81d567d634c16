use crate::config::SecurityConfig;
use crate::errors::GatewayError;
use crate::services::cache::CacheService;
use crate::services::logger::Logger;
use std::sync::Arc;

/// Fixed-window request limiter keyed by (subject, action). Counters live in
/// the shared cache tier with the window as their TTL, so the window resets
/// abruptly when the key expires. A caller can therefore burst up to twice
/// the limit across a window boundary; that approximation is intentional.
pub struct RateLimiter {
    logger: Logger,
    config: SecurityConfig,
    cache: Arc<CacheService>,
}

impl RateLimiter {
    pub fn new(logger: Logger, config: SecurityConfig, cache: Arc<CacheService>) -> Self {
        Self {
            logger: logger.child("ratelimit"),
            config,
            cache,
        }
    }

    fn counter_key(subject: &str, action: &str) -> String {
        format!("ratelimit:{}:{}", subject, action)
    }

    pub async fn check(&self, subject: &str, action: &str) -> Result<(), GatewayError> {
        let key = Self::counter_key(subject, action);
        let count = self.cache.incr(&key, self.config.rate_limit_window).await;
        if count > self.config.rate_limit_max {
            self.logger.warn(
                "Rate limit exceeded",
                Some(&serde_json::json!({
                    "subject": subject,
                    "action": action,
                    "count": count,
                })),
            );
            return Err(GatewayError::rate_limited(format!(
                "Rate limit exceeded for action {}",
                action
            ))
            .with_details(serde_json::json!({
                "subject": subject,
                "limit": self.config.rate_limit_max,
                "window_secs": self.config.rate_limit_window.as_secs(),
            }))
            .with_hint("Retry after the current window expires."));
        }
        Ok(())
    }
}
