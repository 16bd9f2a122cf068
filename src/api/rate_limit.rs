//! Windowed per-address rate limiting.
//!
//! Four profiles: general API traffic, uploads, lenient health checks with
//! a private-network skip, and channel-id validation (which only counts
//! failures so legitimate traffic is never punished).

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::AppState;
use crate::error::{ApiError, ErrorCode};

const GENERAL_MAX: u32 = 300;
const GENERAL_WINDOW: Duration = Duration::from_secs(60);

const UPLOAD_MAX: u32 = 20;
const UPLOAD_WINDOW: Duration = Duration::from_secs(300);

const FILE_MAX: u32 = 10;
const FILE_WINDOW: Duration = Duration::from_secs(300);

const HEALTH_MAX: u32 = 600;
const HEALTH_WINDOW: Duration = Duration::from_secs(60);

const VALIDATION_MAX: u32 = 30;
const VALIDATION_WINDOW: Duration = Duration::from_secs(60);

/// Client address attached to the request as an extension, resolved from
/// the socket or `x-forwarded-for`.
#[derive(Debug, Clone, Copy)]
pub struct ClientIp(pub Option<IpAddr>);

/// Fixed-window counter keyed by source address.
pub struct WindowLimiter {
    max: u32,
    window: Duration,
    hits: Mutex<HashMap<IpAddr, (Instant, u32)>>,
}

impl WindowLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, HashMap<IpAddr, (Instant, u32)>> {
        match self.hits.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Count a hit; `false` once the window's budget is spent.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut hits = self.locked();
        let entry = hits.entry(ip).or_insert((now, 0));
        if now.duration_since(entry.0) > self.window {
            *entry = (now, 0);
        }
        entry.1 += 1;
        entry.1 <= self.max
    }

    /// Peek without counting; used where only failures are charged.
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let hits = self.locked();
        hits.get(&ip)
            .is_some_and(|(start, count)| now.duration_since(*start) <= self.window && *count >= self.max)
    }

    /// Charge a failure against the window.
    pub fn record_failure(&self, ip: IpAddr) {
        let now = Instant::now();
        let mut hits = self.locked();
        let entry = hits.entry(ip).or_insert((now, 0));
        if now.duration_since(entry.0) > self.window {
            *entry = (now, 0);
        }
        entry.1 += 1;
    }
}

pub struct RateLimiters {
    pub general: WindowLimiter,
    pub uploads: WindowLimiter,
    /// Stricter than `uploads`: charged only when a file write happens.
    pub files: WindowLimiter,
    pub health: WindowLimiter,
    pub channel_validation: WindowLimiter,
}

impl RateLimiters {
    pub fn new() -> Self {
        Self {
            general: WindowLimiter::new(GENERAL_MAX, GENERAL_WINDOW),
            uploads: WindowLimiter::new(UPLOAD_MAX, UPLOAD_WINDOW),
            files: WindowLimiter::new(FILE_MAX, FILE_WINDOW),
            health: WindowLimiter::new(HEALTH_MAX, HEALTH_WINDOW),
            channel_validation: WindowLimiter::new(VALIDATION_MAX, VALIDATION_WINDOW),
        }
    }
}

impl Default for RateLimiters {
    fn default() -> Self {
        Self::new()
    }
}

fn is_private_network(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// Resolve the client address once per request and stash it as an
/// extension for handlers and later middleware.
pub async fn attach_client_ip(mut request: Request, next: Next) -> Response {
    let from_socket = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());
    let from_header = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok());

    request
        .extensions_mut()
        .insert(ClientIp(from_socket.or(from_header)));
    next.run(request).await
}

/// Windowed limiting for `/api` traffic. Health sub-routes get the lenient
/// profile and skip private-network callers entirely.
pub async fn general_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(ip) = request
        .extensions()
        .get::<ClientIp>()
        .and_then(|c| c.0)
    else {
        // No resolvable address (in-process tests); nothing to key on.
        return next.run(request).await;
    };

    let is_health = request.uri().path().ends_with("/health");
    let allowed = if is_health {
        is_private_network(ip) || state.rate_limits.health.check(ip)
    } else {
        state.rate_limits.general.check(ip)
    };

    if !allowed {
        tracing::warn!(ip = %ip, path = request.uri().path(), "rate limit exceeded");
        return ApiError::new(ErrorCode::RateLimitExceeded, "too many requests").into_response();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(std::net::Ipv4Addr::new(203, 0, 113, last))
    }

    #[test]
    fn limiter_blocks_after_budget() {
        let limiter = WindowLimiter::new(3, Duration::from_secs(60));
        let addr = ip(1);
        assert!(limiter.check(addr));
        assert!(limiter.check(addr));
        assert!(limiter.check(addr));
        assert!(!limiter.check(addr));
        // Other addresses are unaffected.
        assert!(limiter.check(ip(2)));
    }

    #[test]
    fn failure_only_counting() {
        let limiter = WindowLimiter::new(2, Duration::from_secs(60));
        let addr = ip(3);
        assert!(!limiter.is_blocked(addr));
        limiter.record_failure(addr);
        limiter.record_failure(addr);
        assert!(limiter.is_blocked(addr));
        // Peeking never spends budget.
        assert!(limiter.is_blocked(addr));
    }

    #[test]
    fn private_network_detection() {
        assert!(is_private_network("127.0.0.1".parse().unwrap()));
        assert!(is_private_network("10.1.2.3".parse().unwrap()));
        assert!(is_private_network("192.168.0.10".parse().unwrap()));
        assert!(is_private_network("::1".parse().unwrap()));
        assert!(!is_private_network("203.0.113.7".parse().unwrap()));
    }
}
