use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{api, site, storage};

pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// How a failed step affects the daemon loop.
pub enum StepError {
    /// Step again immediately; the rate limiter handles the delay.
    RetryNow,
    /// A limiter refused to block, meaning we are shutting down. Return
    /// cleanly without surfacing an error.
    Shutdown,
    /// Log, back off exponentially, and keep running.
    NonFatal(anyhow::Error),
    /// Unwind `run()`; the supervisor re-raises this after draining the
    /// other daemons.
    Fatal(anyhow::Error),
}

/// Classifies API client errors the way a scraper step needs them.
pub fn classify_api(err: api::Error) -> StepError {
    match err {
        api::Error::WouldBlock(_) => StepError::Shutdown,
        api::Error::CallLimitExceeded(_) => StepError::RetryNow,
        api::Error::InvalidApiKey(_) => StepError::Fatal(err.into()),
        api::Error::Api { .. } => StepError::NonFatal(err.into()),
        api::Error::Protocol(_) => StepError::Fatal(err.into()),
        api::Error::Http(ref http) => match http.status() {
            // 4xx errors are fatal; others are not
            Some(status) if status.is_client_error() => StepError::Fatal(err.into()),
            _ => StepError::NonFatal(err.into()),
        },
    }
}

/// Classifies site (non-API) request errors.
pub fn classify_site(err: site::Error) -> StepError {
    match err {
        site::Error::MissingAuth(_) => StepError::Fatal(err.into()),
        site::Error::Request(crate::ratelimit::RequestError::WouldBlock(_)) => StepError::Shutdown,
        site::Error::Request(crate::ratelimit::RequestError::Http(ref http))
        | site::Error::Http(ref http) => match http.status() {
            Some(status) if status.is_client_error() => StepError::Fatal(err.into()),
            _ => StepError::NonFatal(err.into()),
        },
    }
}

/// Classifies database errors: a busy or locked database is retried with
/// backoff, everything else unwinds.
pub fn classify_db(err: storage::Error) -> StepError {
    match &err {
        storage::Error::Sqlx(sqlx::Error::Database(db_err))
            if db_err.message().contains("database is locked")
                || db_err.message().contains("database table is locked") =>
        {
            StepError::NonFatal(err.into())
        }
        storage::Error::Sqlx(sqlx::Error::PoolTimedOut) => StepError::NonFatal(err.into()),
        _ => StepError::Fatal(err.into()),
    }
}

/// Termination flag shared between a daemon's loop and whoever stops it.
/// `terminate()` is idempotent and wakes any backoff sleep.
pub struct Shutdown {
    terminated: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown {
            terminated: watch::Sender::new(false),
        }
    }

    pub fn terminate(&self) {
        self.terminated.send_replace(true);
    }

    pub fn is_terminated(&self) -> bool {
        *self.terminated.borrow()
    }

    /// Sleeps for `wait`, returning early on termination.
    pub async fn sleep(&self, wait: Duration) {
        let mut rx = self.terminated.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = rx.wait_for(|terminated| *terminated) => {}
        }
    }
}

impl Default for Shutdown {
    fn default() -> Shutdown {
        Shutdown::new()
    }
}

/// A long-lived scraper task. Implementors provide `step()`; the provided
/// `run()` loop handles backoff and termination.
#[async_trait]
pub trait Daemon: Send + Sync {
    fn name(&self) -> &'static str;

    fn shutdown(&self) -> &Shutdown;

    /// Performs one unit of work and returns how long to wait before the
    /// next step.
    async fn step(&self) -> Result<Duration, StepError>;

    /// Requests termination. Implementors holding a limiter additionally
    /// flip it to non-blocking so parked `acquire()` calls unblock.
    fn terminate(&self) {
        self.shutdown().terminate();
    }

    async fn run(&self) -> anyhow::Result<()> {
        info!("{}: starting", self.name());
        let mut fail_streak = 0u32;

        while !self.shutdown().is_terminated() {
            let mut wait = Duration::ZERO;

            match self.step().await {
                Ok(next_wait) => {
                    wait = next_wait;
                    fail_streak = 0;
                }
                Err(StepError::RetryNow) | Err(StepError::Shutdown) => {
                    fail_streak = 0;
                }
                Err(StepError::NonFatal(err)) => {
                    warn!("{}: non-fatal error: {err:#}", self.name());
                    fail_streak += 1;
                }
                Err(StepError::Fatal(err)) => {
                    return Err(err);
                }
            }

            if fail_streak > 0 {
                let backoff = Duration::from_secs(
                    2u64.saturating_pow(fail_streak.min(32)),
                )
                .min(MAX_BACKOFF);
                info!(
                    "{}: backing off {:.1}s",
                    self.name(),
                    backoff.as_secs_f64()
                );
                wait = wait.max(backoff);
            }

            if !wait.is_zero() {
                self.shutdown().sleep(wait).await;
            }
        }

        info!("{}: terminated", self.name());
        Ok(())
    }
}
