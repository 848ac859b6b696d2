use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};

use crate::ratelimit::{ApiRateLimiter, RateLimiter};

/// Runtime configuration, loaded from the environment (optionally seeded
/// from a `.env` file by the caller).
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory holding the cache databases and `auth.json`.
    pub cache_dir: PathBuf,
    /// Override for the auth file location; defaults to `auth.json` inside
    /// the cache directory.
    pub auth_file: Option<PathBuf>,
    pub scrape_metadata: bool,
    pub scrape_metadata_tip: bool,
    pub scrape_snatchlist: bool,
    /// API quota: at most `api_max_calls` calls in any sliding window of
    /// `api_period` seconds, shared by all scrapers.
    pub api_max_calls: usize,
    pub api_period: f64,
    /// Generic site HTTP limit: average requests per second with a burst
    /// allowance.
    pub web_request_rate: f64,
    pub web_request_burst: f64,
    /// Seconds between the start of one full snatchlist pass and the next.
    pub snatchlist_period: f64,
    /// When set, a watchdog daemon exits fatally once this is no longer our
    /// parent pid.
    pub parent_pid: Option<u32>,
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T>
where
    T::Err: Display,
{
    match env::var(name) {
        Ok(value) => match value.trim().parse() {
            Ok(parsed) => Ok(parsed),
            Err(err) => bail!("invalid {name} value {value:?}: {err}"),
        },
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).context(name),
    }
}

impl Config {
    pub fn from_env() -> Result<Config> {
        let cache_dir =
            PathBuf::from(env::var("BTN_CACHE_DIR").context("BTN_CACHE_DIR is required")?);
        let auth_file = env::var_os("BTN_AUTH_FILE").map(PathBuf::from);

        let mut scrape_metadata = true;
        let mut scrape_metadata_tip = true;
        let mut scrape_snatchlist = true;
        if let Ok(disable) = env::var("BTN_DISABLE") {
            for kind in disable.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                match kind {
                    "metadata" => scrape_metadata = false,
                    "metadata_tip" => scrape_metadata_tip = false,
                    "snatchlist" => scrape_snatchlist = false,
                    other => bail!("unknown BTN_DISABLE value {other:?}"),
                }
            }
        }

        Ok(Config {
            cache_dir,
            auth_file,
            scrape_metadata,
            scrape_metadata_tip,
            scrape_snatchlist,
            api_max_calls: parse_var("BTN_API_MAX_CALLS", ApiRateLimiter::DEFAULT_MAX_CALLS)?,
            api_period: parse_var(
                "BTN_API_PERIOD",
                ApiRateLimiter::DEFAULT_PERIOD.as_secs_f64(),
            )?,
            web_request_rate: parse_var("BTN_WEB_REQUEST_RATE", RateLimiter::DEFAULT_RATE)?,
            web_request_burst: parse_var("BTN_WEB_REQUEST_BURST", RateLimiter::DEFAULT_BURST)?,
            snatchlist_period: parse_var("BTN_SNATCHLIST_PERIOD", 3600.0)?,
            parent_pid: match env::var("BTN_PARENT_PID") {
                Ok(value) => Some(
                    value
                        .trim()
                        .parse()
                        .with_context(|| format!("invalid BTN_PARENT_PID {value:?}"))?,
                ),
                Err(_) => None,
            },
        })
    }
}
