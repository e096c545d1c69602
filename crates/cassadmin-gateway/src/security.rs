use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const MAX_FAILURES: u32 = 5;
const FAILURE_WINDOW: Duration = Duration::from_secs(60);
const LOCKOUT: Duration = Duration::from_secs(60);

struct RateLimitEntry {
    failures: u32,
    first_failure: Instant,
    locked_until: Option<Instant>,
}

/// Per-client lockout after repeated authentication failures.
pub struct AuthRateLimiter {
    inner: Mutex<HashMap<String, RateLimitEntry>>,
}

impl AuthRateLimiter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Count one failure. Returns true once the client is locked out.
    pub fn record_failure(&self, client: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let entry = inner.entry(client.to_string()).or_insert(RateLimitEntry {
            failures: 0,
            first_failure: now,
            locked_until: None,
        });
        if entry.first_failure + FAILURE_WINDOW < now {
            entry.failures = 0;
            entry.first_failure = now;
        }
        entry.failures += 1;
        if entry.failures >= MAX_FAILURES {
            entry.locked_until = Some(now + LOCKOUT);
            tracing::warn!(
                target: "cassadmin::security",
                client,
                failures = entry.failures,
                lockout_secs = LOCKOUT.as_secs(),
                "client locked out after repeated authentication failures"
            );
        }
        entry.locked_until.is_some_and(|until| until > now)
    }

    pub fn record_success(&self, client: &str) {
        self.inner.lock().remove(client);
    }

    pub fn is_rate_limited(&self, client: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .get(client)
            .and_then(|entry| entry.locked_until)
            .is_some_and(|until| until > Instant::now())
    }

    /// Drop entries whose window and lockout have both passed.
    pub fn prune(&self) {
        let now = Instant::now();
        self.inner.lock().retain(|_, entry| {
            let window_open = entry.first_failure + FAILURE_WINDOW > now;
            let locked = entry.locked_until.is_some_and(|until| until > now);
            window_open || locked
        });
    }

    pub fn tracked_clients(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Default for AuthRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn security_headers_middleware(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        axum::http::header::HeaderName::from_static("x-content-type-options"),
        axum::http::HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        axum::http::header::HeaderName::from_static("x-frame-options"),
        axum::http::HeaderValue::from_static("DENY"),
    );
    headers.insert(
        axum::http::header::CACHE_CONTROL,
        axum::http::HeaderValue::from_static("no-store"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_new() {
        let limiter = AuthRateLimiter::new();
        assert!(!limiter.is_rate_limited("192.168.1.1"));
    }

    #[test]
    fn rate_limiter_single_failure_not_limited() {
        let limiter = AuthRateLimiter::new();
        assert!(!limiter.record_failure("192.168.1.1"));
        assert!(!limiter.is_rate_limited("192.168.1.1"));
    }

    #[test]
    fn rate_limiter_five_failures_causes_limit() {
        let limiter = AuthRateLimiter::new();
        for _ in 0..4 {
            assert!(!limiter.record_failure("192.168.1.1"));
        }
        assert!(limiter.record_failure("192.168.1.1"));
        assert!(limiter.is_rate_limited("192.168.1.1"));
    }

    #[test]
    fn rate_limiter_clients_independent() {
        let limiter = AuthRateLimiter::new();
        for _ in 0..5 {
            limiter.record_failure("192.168.1.1");
        }
        assert!(limiter.is_rate_limited("192.168.1.1"));
        assert!(!limiter.is_rate_limited("192.168.1.2"));
        assert!(!limiter.is_rate_limited("stdio"));
    }

    #[test]
    fn rate_limiter_success_clears_failures() {
        let limiter = AuthRateLimiter::new();
        for _ in 0..4 {
            limiter.record_failure("10.0.0.1");
        }
        limiter.record_success("10.0.0.1");
        assert!(!limiter.record_failure("10.0.0.1"));
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[test]
    fn rate_limiter_prune_keeps_active_entries() {
        let limiter = AuthRateLimiter::new();
        limiter.record_failure("10.0.0.1");
        for _ in 0..5 {
            limiter.record_failure("10.0.0.2");
        }
        limiter.prune();
        assert_eq!(limiter.tracked_clients(), 2);
        assert!(limiter.is_rate_limited("10.0.0.2"));
    }
}
