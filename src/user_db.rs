use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use thiserror::Error;

use crate::api::types::{GetUserSnatchlistResult, SnatchEntry};
use crate::storage::{Apply, Migrations};

pub const MIGRATIONS: Migrations = Migrations {
    application_id: 1194369890,
    latest: 1_000_000,
    ddl: &["create table snatchlist (
        id integer primary key,
        downloaded integer,
        uploaded integer,
        seed_time integer,
        seeding tinyint,
        snatch_time integer,
        hnr_removed tinyint not null default 0
    )"],
};

const SNATCH_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
#[error("bad snatch time {value:?} for torrent entry {id}")]
pub struct SnatchTimeError {
    id: i64,
    value: String,
}

#[derive(Debug, Clone)]
struct SnatchEntryRow {
    id: i64,
    downloaded: i64,
    uploaded: i64,
    seed_time: i64,
    seeding: i64,
    snatch_time: i64,
}

fn entry_to_row(entry: &SnatchEntry) -> Result<SnatchEntryRow, SnatchTimeError> {
    let snatch_time = NaiveDateTime::parse_from_str(&entry.snatch_time, SNATCH_TIME_FORMAT)
        .map_err(|_| SnatchTimeError {
            id: entry.id,
            value: entry.snatch_time.clone(),
        })?
        .and_utc()
        .timestamp();

    Ok(SnatchEntryRow {
        id: entry.id,
        downloaded: entry.downloaded,
        uploaded: entry.uploaded,
        seed_time: entry.seed_time,
        seeding: entry.is_seeding,
        snatch_time,
    })
}

/// Upserts snatch records on torrent-entry id. Only the scraped columns are
/// written; the user-owned `hnr_removed` flag is never touched.
pub struct SnatchEntriesUpdate {
    rows: Vec<SnatchEntryRow>,
}

impl SnatchEntriesUpdate {
    pub fn new<'a>(
        entries: impl IntoIterator<Item = &'a SnatchEntry>,
    ) -> Result<SnatchEntriesUpdate, SnatchTimeError> {
        let rows = entries
            .into_iter()
            .map(entry_to_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SnatchEntriesUpdate { rows })
    }

    pub fn from_result(
        result: &GetUserSnatchlistResult,
    ) -> Result<SnatchEntriesUpdate, SnatchTimeError> {
        SnatchEntriesUpdate::new(result.snatches.values())
    }
}

#[async_trait]
impl Apply for SnatchEntriesUpdate {
    async fn apply(&self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        for chunk in self.rows.chunks(32_000 / 6) {
            let mut query = QueryBuilder::<Sqlite>::new(
                "insert into snatchlist \
                 (id, downloaded, uploaded, seed_time, seeding, snatch_time) ",
            );
            query.push_values(chunk, |mut bind, row| {
                bind.push_bind(row.id)
                    .push_bind(row.downloaded)
                    .push_bind(row.uploaded)
                    .push_bind(row.seed_time)
                    .push_bind(row.seeding)
                    .push_bind(row.snatch_time);
            });
            query.push(
                " on conflict (id) do update set \
                 downloaded = excluded.downloaded, \
                 uploaded = excluded.uploaded, \
                 seed_time = excluded.seed_time, \
                 seeding = excluded.seeding, \
                 snatch_time = excluded.snatch_time",
            );
            query.build().persistent(false).execute(&mut *conn).await?;
        }
        Ok(())
    }
}
