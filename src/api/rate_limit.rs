//! Per-IP request pacing (GCRA).
//!
//! Each client IP carries a single piece of state: the *theoretical arrival
//! time* of its next conforming request, advanced by one emission interval
//! (`60s / rpm`) per admitted request. A request conforms when that
//! schedule has not run further ahead of real time than the burst
//! tolerance — half the RPM's worth of intervals, rounded up. One `Instant`
//! per IP is the whole bookkeeping; there are no token counts to refill.
//!
//! Pacing is disabled entirely when the config leaves `rate_limit_rpm`
//! unset. Rejected requests get `429` with `Retry-After` (whole seconds
//! until the next conforming slot) and the standard policy headers.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;

use super::ServerState;

/// Shared pacer; schedule slots are created on first sight of an IP.
pub struct RateLimiter {
    pub rpm: u32,
    /// Spacing between requests at the sustained rate.
    emission: Duration,
    /// How far ahead of real time the schedule may run — the burst
    /// allowance, sized at `ceil(rpm / 2) - 1` emission intervals so a
    /// fresh client gets exactly `ceil(rpm / 2)` back-to-back requests.
    tolerance: Duration,
    /// Theoretical arrival time of each IP's next request.
    slots: DashMap<IpAddr, Instant>,
}

impl RateLimiter {
    pub fn new(rpm: u32) -> Self {
        let rpm = rpm.max(1);
        let emission = Duration::from_secs_f64(60.0 / f64::from(rpm));
        let burst = rpm.div_ceil(2);
        Self {
            rpm,
            emission,
            tolerance: emission * burst.saturating_sub(1),
            slots: DashMap::new(),
        }
    }

    /// Admit or reject one request from `ip`.
    ///
    /// `Err` carries the whole seconds to wait until the schedule next has
    /// a conforming slot.
    pub fn check(&self, ip: IpAddr) -> Result<(), u64> {
        let now = Instant::now();
        let mut slot = self.slots.entry(ip).or_insert(now);

        // A schedule that fell behind real time snaps forward — idle time
        // is not banked beyond the burst tolerance.
        let next_arrival = (*slot).max(now);

        let ahead = next_arrival.duration_since(now);
        if ahead > self.tolerance {
            let wait = ahead - self.tolerance;
            return Err((wait.as_secs_f64().ceil() as u64).max(1));
        }

        *slot = next_arrival + self.emission;
        Ok(())
    }
}

/// Axum middleware enforcing the pacer; passes through when disabled.
/// Falls back to `127.0.0.1` when `ConnectInfo` is absent (tests).
pub async fn rate_limit_middleware(
    State(state): State<Arc<ServerState>>,
    req: Request,
    next: Next,
) -> Response {
    if let Some(limiter) = &state.rate_limiter {
        let ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|c| c.0.ip())
            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));

        if let Err(retry_after) = limiter.check(ip) {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [
                    ("retry-after", retry_after.to_string()),
                    ("x-ratelimit-limit", limiter.rpm.to_string()),
                    ("x-ratelimit-policy", format!("{};w=60", limiter.rpm)),
                ],
                axum::Json(serde_json::json!({
                    "error": {
                        "message": "rate limit exceeded",
                        "type": "invalid_request_error",
                        "code": "rate_limited",
                    }
                })),
            )
                .into_response();
        }
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn fresh_client_gets_half_the_rpm_as_burst() {
        let limiter = RateLimiter::new(60); // burst = 30
        let client = ip(1);
        let admitted = (0..60).filter(|_| limiter.check(client).is_ok()).count();
        assert_eq!(admitted, 30);
    }

    #[test]
    fn overrun_schedule_reports_a_wait() {
        let limiter = RateLimiter::new(60);
        let client = ip(2);
        while limiter.check(client).is_ok() {}
        let wait = limiter.check(client).unwrap_err();
        assert!(wait >= 1);
    }

    #[test]
    fn schedules_are_per_ip() {
        let limiter = RateLimiter::new(4); // burst = 2
        let a = ip(3);
        let b = ip(4);
        let _ = limiter.check(a);
        let _ = limiter.check(a);
        assert!(limiter.check(a).is_err());
        assert!(limiter.check(b).is_ok(), "b's schedule is independent of a's");
    }

    #[test]
    fn odd_rpm_rounds_the_burst_up() {
        let limiter = RateLimiter::new(5); // burst = ceil(5/2) = 3
        let client = ip(5);
        let admitted = (0..10).filter(|_| limiter.check(client).is_ok()).count();
        assert_eq!(admitted, 3);
    }

    #[test]
    fn rpm_of_one_still_admits_a_first_request() {
        let limiter = RateLimiter::new(1); // burst = 1, zero tolerance
        let client = ip(6);
        assert!(limiter.check(client).is_ok());
        assert!(limiter.check(client).is_err(), "second request must wait a full minute");
    }
}
