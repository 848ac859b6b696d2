use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

/// Raised by a non-blocking limiter when a call would have to wait.
///
/// `wait` is the limiter's estimate of how long the caller would have had to
/// sleep before the next call could proceed.
#[derive(Debug, Clone, Copy, Error)]
#[error("rate limiter would block for {:.1}s", wait.as_secs_f64())]
pub struct WouldBlock {
    pub wait: Duration,
}

/// Gate shared by both limiter flavors.
pub trait Limiter: Send + Sync {
    /// Waits until the next call is permitted, or fails with [`WouldBlock`]
    /// in non-blocking mode.
    fn acquire(&self) -> impl Future<Output = Result<(), WouldBlock>> + Send;

    /// Toggles blocking mode. Switching to non-blocking wakes every waiter
    /// parked in [`Limiter::acquire`] so it exits with [`WouldBlock`].
    fn set_blocking(&self, blocking: bool);

    fn get_blocking(&self) -> bool;
}

/// Parks until `wait` elapses or the blocking flag flips to `false`.
async fn wait_or_unblock(blocking: &watch::Sender<bool>, wait: Duration) -> Result<(), WouldBlock> {
    if wait.is_zero() {
        return Ok(());
    }

    let mut rx = blocking.subscribe();

    if !*rx.borrow() {
        return Err(WouldBlock { wait });
    }

    tokio::select! {
        _ = tokio::time::sleep(wait) => {}
        _ = rx.wait_for(|blocking| !*blocking) => {}
    }

    Ok(())
}

/// Sliding-window limiter for the tracker's JSON-RPC quota.
///
/// Permits at most `max_calls` acquisitions in any window of `period`
/// seconds, matching the server's own accounting. Timestamps of past
/// passages are kept so the window slides instead of resetting at fixed
/// boundaries.
pub struct ApiRateLimiter {
    max_calls: usize,
    period: f64,
    origin: Instant,
    /// Sorted monotonic timestamps of calls, in the interval
    /// `(now - period, now]`, as seconds since `origin`.
    calls: Mutex<Vec<f64>>,
    blocking: watch::Sender<bool>,
}

impl ApiRateLimiter {
    pub const DEFAULT_MAX_CALLS: usize = 150;
    pub const DEFAULT_PERIOD: Duration = Duration::from_secs(3600);

    pub fn new(max_calls: usize, period: Duration) -> ApiRateLimiter {
        ApiRateLimiter {
            max_calls,
            period: period.as_secs_f64(),
            origin: Instant::now(),
            calls: Mutex::new(Vec::new()),
            blocking: watch::Sender::new(true),
        }
    }

    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn trim(calls: &mut Vec<f64>, now: f64, period: f64) {
        calls.retain(|&t| t > now - period && t <= now);
    }

    /// Adjusts state so that exactly `remaining` passages are usable in the
    /// current window. Used to reconverge with the server when it reports
    /// quota exhaustion out of band.
    pub fn set_remaining(&self, remaining: usize) {
        let now = self.now();
        let mut calls = self.calls.lock();
        Self::trim(&mut calls, now, self.period);

        if self.max_calls > calls.len() + remaining {
            // Mark N synthetic calls, made at evenly-distributed times
            let delta = self.max_calls - calls.len() - remaining;
            for i in 0..delta {
                calls.push(now - i as f64 * self.period / delta as f64);
            }
            calls.sort_unstable_by(f64::total_cmp);
        } else {
            // Disregard the N most recent calls
            let delta = calls.len() + remaining - self.max_calls;
            let keep = calls.len() - delta.min(calls.len());
            calls.truncate(keep);
        }
    }

    fn try_acquire(&self) -> Result<(), Duration> {
        let now = self.now();
        let mut calls = self.calls.lock();
        Self::trim(&mut calls, now, self.period);

        if calls.len() < self.max_calls {
            calls.push(now);
            debug!(
                "making 1 call, {} remaining",
                self.max_calls - calls.len()
            );
            return Ok(());
        }

        let nth_oldest = calls[calls.len() - self.max_calls];
        Err(Duration::from_secs_f64(
            (nth_oldest + self.period - now).max(0.0),
        ))
    }
}

impl Limiter for ApiRateLimiter {
    async fn acquire(&self) -> Result<(), WouldBlock> {
        loop {
            let wait = match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            if !wait.is_zero() && *self.blocking.borrow() {
                debug!("waiting {:.1}s to rate limit calls", wait.as_secs_f64());
            }
            wait_or_unblock(&self.blocking, wait).await?;
        }
    }

    fn set_blocking(&self, blocking: bool) {
        self.blocking.send_replace(blocking);
    }

    fn get_blocking(&self) -> bool {
        *self.blocking.borrow()
    }
}

/// Continuous-time leaky-bucket limiter for generic site HTTP.
///
/// Permits calls at an average of `rate` per second with burst capacity
/// `burst`, tracked as a virtual "empty time" rather than discrete tokens.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    origin: Instant,
    /// The instant at which the bucket was last (virtually) empty, as
    /// seconds since `origin`.
    zero_time: Mutex<f64>,
    blocking: watch::Sender<bool>,
}

impl RateLimiter {
    pub const DEFAULT_RATE: f64 = 0.2;
    pub const DEFAULT_BURST: f64 = 10.0;

    pub fn new(rate: f64, burst: f64) -> RateLimiter {
        RateLimiter {
            rate,
            burst,
            origin: Instant::now(),
            zero_time: Mutex::new(f64::NEG_INFINITY),
            blocking: watch::Sender::new(true),
        }
    }

    fn try_acquire(&self) -> Result<(), Duration> {
        let now = self.origin.elapsed().as_secs_f64();
        let mut zero_time = self.zero_time.lock();
        let have = ((now - *zero_time) * self.rate).min(self.burst);

        if have >= 1.0 {
            debug!("consuming 1 token, {:.1} remaining", have - 1.0);
            *zero_time = now - (have - 1.0) / self.rate;
            return Ok(());
        }

        Err(Duration::from_secs_f64(
            ((1.0 - have) / self.rate).max(0.0),
        ))
    }
}

impl Limiter for RateLimiter {
    async fn acquire(&self) -> Result<(), WouldBlock> {
        loop {
            let wait = match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            if !wait.is_zero() && *self.blocking.borrow() {
                debug!(
                    "waiting {:.1}s to rate limit requests",
                    wait.as_secs_f64()
                );
            }
            wait_or_unblock(&self.blocking, wait).await?;
        }
    }

    fn set_blocking(&self, blocking: bool) {
        self.blocking.send_replace(blocking);
    }

    fn get_blocking(&self) -> bool {
        *self.blocking.borrow()
    }
}

/// Error surfaced by [`GatedClient`], so callers see uniform behavior
/// whether the gate refused the request or the transport failed.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request would block: {0}")]
    WouldBlock(#[from] WouldBlock),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// HTTP client that runs a limiter's gate before every outbound request
/// whose URL matches the configured prefix.
pub struct GatedClient<L> {
    http: reqwest::Client,
    url_prefix: String,
    limiter: Arc<L>,
}

impl<L: Limiter> GatedClient<L> {
    pub fn new(http: reqwest::Client, url_prefix: impl Into<String>, limiter: Arc<L>) -> Self {
        GatedClient {
            http,
            url_prefix: url_prefix.into(),
            limiter,
        }
    }

    /// The underlying transport, for building requests.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn limiter(&self) -> &Arc<L> {
        &self.limiter
    }

    pub async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, RequestError> {
        if request.url().as_str().starts_with(&self.url_prefix) {
            self.limiter.acquire().await?;
        }

        Ok(self.http.execute(request).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn api_limiter_max_calls_nonblocking() {
        let limiter = ApiRateLimiter::new(150, Duration::from_secs(3600));
        limiter.set_blocking(false);
        for _ in 0..150 {
            limiter.acquire().await.unwrap();
        }
        // Next call should fail instead of blocking
        let err = limiter.acquire().await.unwrap_err();
        assert!(err.wait > Duration::ZERO);
    }

    #[tokio::test]
    async fn api_limiter_max_calls_blocking() {
        let limiter = ApiRateLimiter::new(20, Duration::from_millis(250));
        let start = Instant::now();
        for _ in 0..21 {
            limiter.acquire().await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn api_limiter_calls_age_out() {
        let limiter = ApiRateLimiter::new(20, Duration::from_millis(250));
        limiter.set_blocking(false);
        for _ in 0..20 {
            limiter.acquire().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        limiter.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn api_limiter_set_remaining_zero() {
        let limiter = ApiRateLimiter::new(150, Duration::from_secs(3600));
        limiter.set_blocking(false);
        limiter.set_remaining(0);
        limiter.acquire().await.unwrap_err();
    }

    #[tokio::test]
    async fn api_limiter_set_remaining_decrease() {
        let limiter = ApiRateLimiter::new(150, Duration::from_secs(3600));
        limiter.set_blocking(false);
        limiter.set_remaining(100);
        for _ in 0..100 {
            limiter.acquire().await.unwrap();
        }
        limiter.acquire().await.unwrap_err();
    }

    #[tokio::test]
    async fn api_limiter_quota_exhaustion_recovery() {
        let limiter = ApiRateLimiter::new(2, Duration::from_secs(60));
        limiter.set_blocking(false);
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();
        let err = limiter.acquire().await.unwrap_err();
        assert!(err.wait > Duration::ZERO);

        limiter.set_remaining(2);
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap_err();
    }

    #[tokio::test]
    async fn api_limiter_get_set_blocking() {
        let limiter = ApiRateLimiter::new(150, Duration::from_secs(3600));
        assert!(limiter.get_blocking());
        limiter.set_blocking(false);
        assert!(!limiter.get_blocking());
        limiter.set_blocking(true);
        assert!(limiter.get_blocking());
    }

    #[tokio::test]
    async fn api_limiter_set_blocking_wakes_waiter() {
        let limiter = Arc::new(ApiRateLimiter::new(10, Duration::from_secs(3600)));
        for _ in 0..10 {
            limiter.acquire().await.unwrap();
        }
        // Next call parks; flip to non-blocking from another task
        tokio::spawn({
            let limiter = limiter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                limiter.set_blocking(false);
            }
        });
        let start = Instant::now();
        limiter.acquire().await.unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn bucket_burst_without_blocking() {
        let limiter = RateLimiter::new(0.001, 10.0);
        limiter.set_blocking(false);
        for _ in 0..10 {
            limiter.acquire().await.unwrap();
        }
        limiter.acquire().await.unwrap_err();
    }

    #[tokio::test]
    async fn bucket_fills() {
        let limiter = RateLimiter::new(100.0, 10.0);
        limiter.set_blocking(false);
        for _ in 0..10 {
            limiter.acquire().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        for _ in 0..10 {
            limiter.acquire().await.unwrap();
        }
    }

    #[tokio::test]
    async fn bucket_set_blocking_wakes_waiter() {
        let limiter = Arc::new(RateLimiter::new(0.001, 1.0));
        limiter.acquire().await.unwrap();
        tokio::spawn({
            let limiter = limiter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                limiter.set_blocking(false);
            }
        });
        let start = Instant::now();
        limiter.acquire().await.unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
