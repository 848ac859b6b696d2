use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use btn_cache::api::{self, RateLimitedApi};
use btn_cache::config::Config;
use btn_cache::ratelimit::{ApiRateLimiter, GatedClient, RateLimiter};
use btn_cache::scrape::{
    MetadataScraper, MetadataTipScraper, SnatchlistScraper, Supervisor,
};
use btn_cache::site::{self, UserAccess};
use btn_cache::storage::Storage;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let storage = Storage::new(config.cache_dir.clone());

    let auth = match &config.auth_file {
        Some(path) => {
            let data = std::fs::read(path)
                .with_context(|| format!("reading auth file {}", path.display()))?;
            serde_json::from_slice(&data)
                .with_context(|| format!("parsing auth file {}", path.display()))?
        }
        None => storage
            .read_user_auth()
            .with_context(|| format!("reading {}", storage.auth_file_path().display()))?,
    };

    let http = reqwest::Client::new();

    let api_rate_limiter = Arc::new(ApiRateLimiter::new(
        config.api_max_calls,
        Duration::from_secs_f64(config.api_period),
    ));
    let site_rate_limiter = Arc::new(RateLimiter::new(
        config.web_request_rate,
        config.web_request_burst,
    ));

    let api_key = auth.api_key.clone().context("api_key is required")?;
    let api = Arc::new(RateLimitedApi::new(
        api_key,
        GatedClient::new(http.clone(), api::ENDPOINT, api_rate_limiter),
    ));
    let user_access = Arc::new(UserAccess::new(
        auth,
        GatedClient::new(http, site::SITE, site_rate_limiter),
    ));

    let mut supervisor = Supervisor::new();

    if config.scrape_metadata || config.scrape_metadata_tip {
        let metadata_pool = storage.open_metadata_pool().await?;
        if config.scrape_metadata {
            supervisor.add(Arc::new(MetadataScraper::new(
                api.clone(),
                metadata_pool.clone(),
            )));
        }
        if config.scrape_metadata_tip {
            supervisor.add(Arc::new(MetadataTipScraper::new(
                api.clone(),
                user_access.clone(),
                metadata_pool,
            )));
        }
    }

    if config.scrape_snatchlist {
        let user_pool = storage.open_user_pool().await?;
        supervisor.add(Arc::new(SnatchlistScraper::new(
            api.clone(),
            user_pool,
            Duration::from_secs_f64(config.snatchlist_period),
        )));
    }

    #[cfg(unix)]
    if let Some(parent_pid) = config.parent_pid {
        supervisor.add(Arc::new(btn_cache::scrape::ParentChecker::new(parent_pid)));
    }

    anyhow::ensure!(!supervisor.is_empty(), "all scrapers are disabled");

    // Wire signals to the supervisor's termination path; the limiters'
    // non-blocking switch unblocks any daemon parked in acquire()
    tokio::spawn({
        let supervisor = supervisor.clone();
        async move {
            shutdown_signal().await;
            info!("terminating due to signal");
            supervisor.terminate();
        }
    });

    supervisor.run().await
}

/// This future completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
