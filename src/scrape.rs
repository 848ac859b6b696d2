//! Long-lived daemons that scrape the tracker and keep the cache coherent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use sqlx::SqlitePool;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::api::{RateLimitedApi, ALL_RESULTS};
use crate::daemon::{classify_api, classify_db, classify_site, Daemon, Shutdown, StepError};
use crate::metadata_db::{self, UnfilteredSweepUpdate};
use crate::ratelimit::Limiter;
use crate::site::UserAccess;
use crate::user_db::{self, SnatchEntriesUpdate};
use crate::{feed, storage};

// NB: We used to have a torrent-file scraper that would download metafiles
// from the site when file_info was missing. Staff does not like this! Do
// not do it.

/// Walks the whole catalog in overlapping pages, applying deletion
/// inference as it goes, and restarts from the tip on completion.
pub struct MetadataScraper {
    api: Arc<RateLimitedApi>,
    metadata_pool: SqlitePool,
    shutdown: Shutdown,
    offset: Mutex<i64>,
}

impl MetadataScraper {
    pub fn new(api: Arc<RateLimitedApi>, metadata_pool: SqlitePool) -> MetadataScraper {
        MetadataScraper {
            api,
            metadata_pool,
            shutdown: Shutdown::new(),
            offset: Mutex::new(0),
        }
    }
}

#[async_trait]
impl Daemon for MetadataScraper {
    fn name(&self) -> &'static str {
        "metadata_scraper"
    }

    fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    fn terminate(&self) {
        self.shutdown.terminate();
        self.api.rate_limiter().set_blocking(false);
    }

    async fn step(&self) -> Result<Duration, StepError> {
        let offset = *self.offset.lock();
        info!("scraping metadata at offset {offset}");

        let result = self
            .api
            .get_torrents(json!({}), ALL_RESULTS, offset)
            .await
            .map_err(classify_api)?;
        let update = UnfilteredSweepUpdate::new(offset, &result);
        let fetched = update.len() as i64;
        let total = result.results;

        storage::apply_in_write_txn(&self.metadata_pool, &metadata_db::MIGRATIONS, &update)
            .await
            .map_err(classify_db)?;

        // Deletion inference only fires between entries contained in a
        // single result, so consecutive pages must overlap by one row
        *self.offset.lock() = if offset + fetched >= total {
            0
        } else {
            (offset + fetched - 1).max(0)
        };

        Ok(Duration::ZERO)
    }
}

/// Polls the site feed and, when it diverges from the cache, refreshes the
/// newest page of the catalog. The feed is cheap; the API call is not.
pub struct MetadataTipScraper {
    api: Arc<RateLimitedApi>,
    user_access: Arc<UserAccess>,
    metadata_pool: SqlitePool,
    shutdown: Shutdown,
    changes_pending: Mutex<bool>,
}

const TIP_INTERVAL: Duration = Duration::from_secs(60);

impl MetadataTipScraper {
    pub fn new(
        api: Arc<RateLimitedApi>,
        user_access: Arc<UserAccess>,
        metadata_pool: SqlitePool,
    ) -> MetadataTipScraper {
        MetadataTipScraper {
            api,
            user_access,
            metadata_pool,
            shutdown: Shutdown::new(),
            changes_pending: Mutex::new(false),
        }
    }

    async fn read_tip_ids(&self, limit: usize) -> Result<Vec<i64>, storage::Error> {
        let mut conn = self.metadata_pool.acquire().await?;
        let version = metadata_db::MIGRATIONS.get_version(&mut conn).await?;
        if version == 0 {
            return Ok(Vec::new());
        }
        storage::check_breaking(version, metadata_db::MIGRATIONS.latest)?;

        Ok(sqlx::query_scalar(
            "select id from torrent_entry where not deleted \
             order by time desc, id desc limit ?",
        )
        .bind(limit as i64)
        .fetch_all(&mut *conn)
        .await?)
    }

    async fn check_changes(&self) -> Result<(), StepError> {
        if *self.changes_pending.lock() {
            return Ok(());
        }

        let body = self
            .user_access
            .get_feed("torrents_all")
            .await
            .map_err(classify_site)?;
        let feed_ids =
            feed::parse_ids(&body).map_err(|err| StepError::NonFatal(err.into()))?;
        let db_ids = self
            .read_tip_ids(feed_ids.len())
            .await
            .map_err(classify_db)?;

        let changes = feed_ids != db_ids;
        if changes {
            info!("feed indicates changes, scraping metadata");
        } else if let Some(latest) = feed_ids.first() {
            info!("feed indicates no changes. latest is {latest}");
        }
        *self.changes_pending.lock() = changes;

        Ok(())
    }
}

#[async_trait]
impl Daemon for MetadataTipScraper {
    fn name(&self) -> &'static str {
        "metadata_tip_scraper"
    }

    fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    fn terminate(&self) {
        self.shutdown.terminate();
        self.api.rate_limiter().set_blocking(false);
        self.user_access.rate_limiter().set_blocking(false);
    }

    async fn step(&self) -> Result<Duration, StepError> {
        self.check_changes().await?;

        let changes_pending = *self.changes_pending.lock();
        if changes_pending {
            let result = self
                .api
                .get_torrents(json!({}), ALL_RESULTS, 0)
                .await
                .map_err(classify_api)?;
            let update = UnfilteredSweepUpdate::new(0, &result);

            storage::apply_in_write_txn(&self.metadata_pool, &metadata_db::MIGRATIONS, &update)
                .await
                .map_err(classify_db)?;

            *self.changes_pending.lock() = false;
        }

        Ok(TIP_INTERVAL)
    }
}

/// Walks the user's snatch list in blocks, then sleeps out the remainder of
/// the configured period before the next full pass.
pub struct SnatchlistScraper {
    api: Arc<RateLimitedApi>,
    user_pool: SqlitePool,
    shutdown: Shutdown,
    period: Duration,
    state: Mutex<SweepState>,
}

struct SweepState {
    offset: i64,
    start_time: Instant,
}

impl SnatchlistScraper {
    pub const BLOCK_SIZE: i64 = 10_000;

    pub fn new(
        api: Arc<RateLimitedApi>,
        user_pool: SqlitePool,
        period: Duration,
    ) -> SnatchlistScraper {
        SnatchlistScraper {
            api,
            user_pool,
            shutdown: Shutdown::new(),
            period,
            state: Mutex::new(SweepState {
                offset: 0,
                start_time: Instant::now(),
            }),
        }
    }
}

#[async_trait]
impl Daemon for SnatchlistScraper {
    fn name(&self) -> &'static str {
        "snatchlist_scraper"
    }

    fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    fn terminate(&self) {
        self.shutdown.terminate();
        self.api.rate_limiter().set_blocking(false);
    }

    async fn step(&self) -> Result<Duration, StepError> {
        let offset = self.state.lock().offset;
        info!("scraping snatchlist at offset {offset}");

        let result = self
            .api
            .get_user_snatchlist(Self::BLOCK_SIZE, offset)
            .await
            .map_err(classify_api)?;
        let update = SnatchEntriesUpdate::from_result(&result)
            .map_err(|err| StepError::Fatal(err.into()))?;

        storage::apply_in_write_txn(&self.user_pool, &user_db::MIGRATIONS, &update)
            .await
            .map_err(classify_db)?;

        let mut state = self.state.lock();
        state.offset += result.snatches.len() as i64;
        if state.offset < result.results {
            return Ok(Duration::ZERO);
        }

        let now = Instant::now();
        let wait = self.period.saturating_sub(now - state.start_time);
        state.offset = 0;
        state.start_time = now;
        if !wait.is_zero() {
            info!(
                "entire snatchlist scraped, waiting {:.1}s",
                wait.as_secs_f64()
            );
        }

        Ok(wait)
    }
}

/// Watches the parent process and dies fatally when it goes away, so an
/// orphaned scraper does not keep burning quota.
#[cfg(unix)]
pub struct ParentChecker {
    expected_parent_pid: u32,
    shutdown: Shutdown,
}

#[cfg(unix)]
impl ParentChecker {
    pub fn new(expected_parent_pid: u32) -> ParentChecker {
        ParentChecker {
            expected_parent_pid,
            shutdown: Shutdown::new(),
        }
    }
}

#[cfg(unix)]
#[async_trait]
impl Daemon for ParentChecker {
    fn name(&self) -> &'static str {
        "parent_checker"
    }

    fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    async fn step(&self) -> Result<Duration, StepError> {
        if std::os::unix::process::parent_id() != self.expected_parent_pid {
            error!("parent appears to have died, exiting");
            return Err(StepError::Fatal(anyhow::anyhow!(
                "parent process {} died",
                self.expected_parent_pid
            )));
        }
        Ok(Duration::from_secs(5))
    }
}

/// Runs a set of daemons until the first of them completes, then terminates
/// and drains the rest, re-raising the first error seen.
#[derive(Clone, Default)]
pub struct Supervisor {
    daemons: Vec<Arc<dyn Daemon>>,
}

impl Supervisor {
    pub fn new() -> Supervisor {
        Supervisor {
            daemons: Vec::new(),
        }
    }

    pub fn add(&mut self, daemon: Arc<dyn Daemon>) {
        self.daemons.push(daemon);
    }

    pub fn is_empty(&self) -> bool {
        self.daemons.is_empty()
    }

    pub fn terminate(&self) {
        for daemon in &self.daemons {
            daemon.terminate();
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut tasks = JoinSet::new();
        for daemon in &self.daemons {
            let daemon = daemon.clone();
            tasks.spawn(async move { (daemon.name(), daemon.run().await) });
        }

        let mut first_error = None;

        // Wait for any daemon to die or be terminated, then take all of
        // them down
        if let Some(joined) = tasks.join_next().await {
            record_outcome(&mut first_error, joined);
            info!("terminating remaining daemons");
        }
        self.terminate();

        while let Some(joined) = tasks.join_next().await {
            record_outcome(&mut first_error, joined);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn record_outcome(
    first_error: &mut Option<anyhow::Error>,
    joined: Result<(&'static str, anyhow::Result<()>), tokio::task::JoinError>,
) {
    match joined {
        Ok((_, Ok(()))) => {}
        Ok((name, Err(err))) => {
            error!("{name}: fatal error: {err:#}");
            if first_error.is_none() {
                *first_error = Some(err.context(name));
            }
        }
        Err(join_err) => {
            error!("daemon panicked: {join_err}");
            if first_error.is_none() {
                *first_error = Some(anyhow::Error::new(join_err).context("daemon panicked"));
            }
        }
    }
}
