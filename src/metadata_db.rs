use async_trait::async_trait;
use serde::Deserialize;
use serde_bytes::ByteBuf;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use thiserror::Error;

use crate::api::types::{GetTorrentsResult, TorrentEntry};
use crate::storage::{Apply, Migrations};

pub const MIGRATIONS: Migrations = Migrations {
    application_id: -1353141288,
    latest: 1_000_000,
    ddl: &[
        "create table series (
            id integer primary key,
            imdb_id text,
            name text,
            banner text,
            poster text,
            tvdb_id integer,
            tvrage_id integer,
            youtube_trailer text,
            deleted tinyint not null default 0
        )",
        "create table torrent_entry_group (
            id integer primary key,
            category text not null,
            name text,
            series_id integer not null,
            deleted tinyint not null default 0
        )",
        "create table torrent_entry (
            id integer primary key,
            codec text,
            container text,
            group_id integer not null,
            info_hash text not null,
            origin text,
            release_name text,
            resolution text,
            size integer not null,
            source text,
            time integer not null,
            snatched integer not null,
            seeders integer not null,
            leechers integer not null,
            deleted tinyint not null default 0
        )",
        "create table file_info (
            id integer not null,
            file_index integer not null,
            path blob not null,
            encoding text,
            start integer not null,
            stop integer not null,
            primary key (id, file_index)
        )",
        "create index torrent_entry_on_time on torrent_entry (time desc, id desc)",
        "create index torrent_entry_on_group_id on torrent_entry (group_id)",
        "create index torrent_entry_group_on_series_id on torrent_entry_group (series_id)",
    ],
};

/// SQLite's variable limit is 32766 for recent versions; stay under it when
/// chunking multi-row statements.
const MAX_BINDINGS_PER_STATEMENT: usize = 32_000;

#[derive(Debug, Clone)]
struct SeriesRow {
    id: i64,
    imdb_id: Option<String>,
    name: Option<String>,
    banner: Option<String>,
    poster: Option<String>,
    tvdb_id: Option<i64>,
    tvrage_id: Option<i64>,
    youtube_trailer: Option<String>,
    deleted: bool,
}

#[derive(Debug, Clone)]
struct GroupRow {
    id: i64,
    category: String,
    name: Option<String>,
    series_id: i64,
    deleted: bool,
}

#[derive(Debug, Clone)]
struct TorrentEntryRow {
    id: i64,
    codec: Option<String>,
    container: Option<String>,
    group_id: i64,
    info_hash: String,
    origin: Option<String>,
    release_name: Option<String>,
    resolution: Option<String>,
    size: i64,
    source: Option<String>,
    time: i64,
    snatched: i64,
    seeders: i64,
    leechers: i64,
    deleted: bool,
}

fn optional_text(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}

/// External identifiers arrive as decimal strings; empty, zero and
/// unparseable values all normalize to absent.
fn optional_numeric_id(value: &str) -> Option<i64> {
    match value.trim().parse::<i64>() {
        Ok(0) | Err(_) => None,
        Ok(id) => Some(id),
    }
}

fn optional_trailer(value: &str) -> Option<String> {
    match value {
        "" | "0" => None,
        trailer => Some(trailer.to_owned()),
    }
}

fn entry_to_rows(entry: &TorrentEntry) -> (SeriesRow, GroupRow, TorrentEntryRow) {
    let series = SeriesRow {
        id: entry.series_id,
        imdb_id: optional_text(&entry.imdb_id),
        name: optional_text(&entry.series),
        banner: optional_text(&entry.series_banner),
        poster: optional_text(&entry.series_poster),
        tvdb_id: optional_numeric_id(&entry.tvdb_id),
        tvrage_id: optional_numeric_id(&entry.tvrage_id),
        youtube_trailer: optional_trailer(&entry.youtube_trailer),
        deleted: false,
    };
    let group = GroupRow {
        id: entry.group_id,
        category: entry.category.clone(),
        name: optional_text(&entry.group_name),
        series_id: series.id,
        deleted: false,
    };
    let torrent_entry = TorrentEntryRow {
        id: entry.id,
        codec: optional_text(&entry.codec),
        container: optional_text(&entry.container),
        group_id: group.id,
        info_hash: entry.info_hash.clone(),
        origin: optional_text(&entry.origin),
        release_name: optional_text(&entry.release_name),
        resolution: optional_text(&entry.resolution),
        size: entry.size,
        source: optional_text(&entry.source),
        time: entry.time,
        snatched: entry.snatched,
        seeders: entry.seeders,
        leechers: entry.leechers,
        deleted: false,
    };

    (series, group, torrent_entry)
}

/// Insert-or-update of the series, group and torrent-entry rows derived
/// from a set of API torrent entries. Parent rows are written before
/// children, and an update only fires when at least one column actually
/// differs, so untouched rows stay bit-identical.
pub struct TorrentEntriesUpdate {
    series: Vec<SeriesRow>,
    groups: Vec<GroupRow>,
    entries: Vec<TorrentEntryRow>,
}

impl TorrentEntriesUpdate {
    pub fn new<'a>(entries: impl IntoIterator<Item = &'a TorrentEntry>) -> TorrentEntriesUpdate {
        let mut series = std::collections::BTreeMap::new();
        let mut groups = std::collections::BTreeMap::new();
        let mut torrent_entries = std::collections::BTreeMap::new();

        for entry in entries {
            let (series_row, group_row, te_row) = entry_to_rows(entry);
            series.insert(series_row.id, series_row);
            groups.insert(group_row.id, group_row);
            torrent_entries.insert(te_row.id, te_row);
        }

        TorrentEntriesUpdate {
            series: series.into_values().collect(),
            groups: groups.into_values().collect(),
            entries: torrent_entries.into_values().collect(),
        }
    }

    fn entry_keys(&self) -> Vec<(i64, i64)> {
        self.entries.iter().map(|row| (row.time, row.id)).collect()
    }

    async fn upsert_series(&self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        for chunk in self.series.chunks(MAX_BINDINGS_PER_STATEMENT / 9) {
            let mut query = QueryBuilder::<Sqlite>::new(
                "insert into series \
                 (id, imdb_id, name, banner, poster, tvdb_id, tvrage_id, youtube_trailer, deleted) ",
            );
            query.push_values(chunk, |mut bind, row| {
                bind.push_bind(row.id)
                    .push_bind(row.imdb_id.as_deref())
                    .push_bind(row.name.as_deref())
                    .push_bind(row.banner.as_deref())
                    .push_bind(row.poster.as_deref())
                    .push_bind(row.tvdb_id)
                    .push_bind(row.tvrage_id)
                    .push_bind(row.youtube_trailer.as_deref())
                    .push_bind(row.deleted);
            });
            query.push(
                " on conflict (id) do update set \
                 imdb_id = excluded.imdb_id, \
                 name = excluded.name, \
                 banner = excluded.banner, \
                 poster = excluded.poster, \
                 tvdb_id = excluded.tvdb_id, \
                 tvrage_id = excluded.tvrage_id, \
                 youtube_trailer = excluded.youtube_trailer, \
                 deleted = excluded.deleted \
                 where series.imdb_id is not excluded.imdb_id \
                 or series.name is not excluded.name \
                 or series.banner is not excluded.banner \
                 or series.poster is not excluded.poster \
                 or series.tvdb_id is not excluded.tvdb_id \
                 or series.tvrage_id is not excluded.tvrage_id \
                 or series.youtube_trailer is not excluded.youtube_trailer \
                 or series.deleted is not excluded.deleted",
            );
            query.build().persistent(false).execute(&mut *conn).await?;
        }
        Ok(())
    }

    async fn upsert_groups(&self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        for chunk in self.groups.chunks(MAX_BINDINGS_PER_STATEMENT / 5) {
            let mut query = QueryBuilder::<Sqlite>::new(
                "insert into torrent_entry_group (id, category, name, series_id, deleted) ",
            );
            query.push_values(chunk, |mut bind, row| {
                bind.push_bind(row.id)
                    .push_bind(&row.category)
                    .push_bind(row.name.as_deref())
                    .push_bind(row.series_id)
                    .push_bind(row.deleted);
            });
            query.push(
                " on conflict (id) do update set \
                 category = excluded.category, \
                 name = excluded.name, \
                 series_id = excluded.series_id, \
                 deleted = excluded.deleted \
                 where torrent_entry_group.category is not excluded.category \
                 or torrent_entry_group.name is not excluded.name \
                 or torrent_entry_group.series_id is not excluded.series_id \
                 or torrent_entry_group.deleted is not excluded.deleted",
            );
            query.build().persistent(false).execute(&mut *conn).await?;
        }
        Ok(())
    }

    async fn upsert_entries(&self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        for chunk in self.entries.chunks(MAX_BINDINGS_PER_STATEMENT / 15) {
            let mut query = QueryBuilder::<Sqlite>::new(
                "insert into torrent_entry \
                 (id, codec, container, group_id, info_hash, origin, release_name, resolution, \
                 size, source, time, snatched, seeders, leechers, deleted) ",
            );
            query.push_values(chunk, |mut bind, row| {
                bind.push_bind(row.id)
                    .push_bind(row.codec.as_deref())
                    .push_bind(row.container.as_deref())
                    .push_bind(row.group_id)
                    .push_bind(&row.info_hash)
                    .push_bind(row.origin.as_deref())
                    .push_bind(row.release_name.as_deref())
                    .push_bind(row.resolution.as_deref())
                    .push_bind(row.size)
                    .push_bind(row.source.as_deref())
                    .push_bind(row.time)
                    .push_bind(row.snatched)
                    .push_bind(row.seeders)
                    .push_bind(row.leechers)
                    .push_bind(row.deleted);
            });
            query.push(
                " on conflict (id) do update set \
                 codec = excluded.codec, \
                 container = excluded.container, \
                 group_id = excluded.group_id, \
                 info_hash = excluded.info_hash, \
                 origin = excluded.origin, \
                 release_name = excluded.release_name, \
                 resolution = excluded.resolution, \
                 size = excluded.size, \
                 source = excluded.source, \
                 time = excluded.time, \
                 snatched = excluded.snatched, \
                 seeders = excluded.seeders, \
                 leechers = excluded.leechers, \
                 deleted = excluded.deleted \
                 where torrent_entry.codec is not excluded.codec \
                 or torrent_entry.container is not excluded.container \
                 or torrent_entry.group_id is not excluded.group_id \
                 or torrent_entry.info_hash is not excluded.info_hash \
                 or torrent_entry.origin is not excluded.origin \
                 or torrent_entry.release_name is not excluded.release_name \
                 or torrent_entry.resolution is not excluded.resolution \
                 or torrent_entry.size is not excluded.size \
                 or torrent_entry.source is not excluded.source \
                 or torrent_entry.time is not excluded.time \
                 or torrent_entry.snatched is not excluded.snatched \
                 or torrent_entry.seeders is not excluded.seeders \
                 or torrent_entry.leechers is not excluded.leechers \
                 or torrent_entry.deleted is not excluded.deleted",
            );
            query.build().persistent(false).execute(&mut *conn).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Apply for TorrentEntriesUpdate {
    async fn apply(&self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        self.upsert_series(conn).await?;
        self.upsert_groups(conn).await?;
        self.upsert_entries(conn).await?;
        Ok(())
    }
}

/// Applies a `getTorrents` result that claims to be an unfiltered,
/// time-descending slice starting at `offset` out of `total`, and infers
/// deletions from the gaps.
///
/// Entries whose `(time, id)` lies strictly between the slice extremes but
/// are absent from the slice must have been deleted on the tracker. When
/// the slice is the final one, everything strictly older than its oldest
/// entry is deleted as well. Correctness rests on the server returning
/// contiguous slices for unfiltered queries; the tie-break on id handles
/// equal timestamps.
pub struct UnfilteredSweepUpdate {
    entities: TorrentEntriesUpdate,
    offset: i64,
    total: i64,
    /// `(time, id)` of the slice, ordered by `(time desc, id desc)`.
    ordered: Vec<(i64, i64)>,
}

impl UnfilteredSweepUpdate {
    pub fn new(offset: i64, result: &GetTorrentsResult) -> UnfilteredSweepUpdate {
        let entities = TorrentEntriesUpdate::new(result.torrents.values());
        let mut ordered = entities.entry_keys();
        ordered.sort_unstable_by(|a, b| b.cmp(a));

        UnfilteredSweepUpdate {
            entities,
            offset,
            total: result.results,
            ordered,
        }
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    async fn apply_deletions(&self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        let (newest_time, newest_id) = self.ordered[0];
        let (oldest_time, oldest_id) = self.ordered[self.ordered.len() - 1];

        for chunk in self.ordered.chunks(MAX_BINDINGS_PER_STATEMENT) {
            let mut query = QueryBuilder::<Sqlite>::new("insert into temp.ids (id) ");
            query.push_values(chunk, |mut bind, (_, id)| {
                bind.push_bind(*id);
            });
            query.build().persistent(false).execute(&mut *conn).await?;
        }

        if self.offset + self.ordered.len() as i64 >= self.total {
            // This result set represents the oldest torrent entries, so
            // delete all older ones
            sqlx::query(
                "update torrent_entry set deleted = 1 \
                 where not deleted \
                 and (time < ? or (time = ? and id < ?))",
            )
            .bind(oldest_time)
            .bind(oldest_time)
            .bind(oldest_id)
            .execute(&mut *conn)
            .await?;
        }

        sqlx::query(
            "update torrent_entry set deleted = 1 \
             where not deleted \
             and (time < ? or (time = ? and id < ?)) \
             and (time > ? or (time = ? and id > ?)) \
             and id not in (select id from temp.ids)",
        )
        .bind(newest_time)
        .bind(newest_time)
        .bind(newest_id)
        .bind(oldest_time)
        .bind(oldest_time)
        .bind(oldest_id)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl Apply for UnfilteredSweepUpdate {
    async fn apply(&self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        self.entities.apply(conn).await?;
        if self.ordered.is_empty() {
            return Ok(());
        }

        sqlx::query("create temp table ids (id integer not null primary key)")
            .execute(&mut *conn)
            .await?;
        let result = self.apply_deletions(conn).await;
        // The temp table outlives a commit on a pooled connection, so drop
        // it even on success
        let dropped = sqlx::query("drop table temp.ids").execute(&mut *conn).await;
        result?;
        dropped?;

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum InfoError {
    #[error("malformed info dictionary: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Bencode(#[from] serde_bencode::Error),
}

#[derive(Debug, Deserialize)]
struct InfoDict {
    #[serde(default)]
    name: Option<ByteBuf>,
    #[serde(rename = "name.utf-8", default)]
    name_utf8: Option<ByteBuf>,
    #[serde(default)]
    length: Option<i64>,
    #[serde(default)]
    files: Option<Vec<InfoFile>>,
}

#[derive(Debug, Deserialize)]
struct InfoFile {
    length: i64,
    #[serde(default)]
    path: Option<Vec<ByteBuf>>,
    #[serde(rename = "path.utf-8", default)]
    path_utf8: Option<Vec<ByteBuf>>,
}

#[derive(Debug, Clone)]
struct FileInfoRow {
    id: i64,
    file_index: i64,
    /// The file's path, stored as a bencoded list of byte-string
    /// components rooted at the torrent's name.
    path: Vec<u8>,
    encoding: Option<&'static str>,
    start: i64,
    stop: i64,
}

fn encode_path(name: &ByteBuf, path: &[ByteBuf]) -> Result<Vec<u8>, InfoError> {
    let mut components: Vec<&ByteBuf> = Vec::with_capacity(path.len() + 1);
    components.push(name);
    components.extend(path.iter());
    Ok(serde_bencode::to_bytes(&components)?)
}

fn rows_from_info(torrent_entry_id: i64, info: &InfoDict) -> Result<Vec<FileInfoRow>, InfoError> {
    let mut rows = Vec::new();

    if let Some(files) = &info.files {
        // Use the utf-8 variants only when the root name and every file
        // path carry one; a partial set falls back to the legacy keys
        let utf8 = info.name_utf8.is_some() && files.iter().all(|file| file.path_utf8.is_some());
        let mut offset = 0i64;

        for (index, file) in files.iter().enumerate() {
            let (name, path, encoding) = match (&info.name_utf8, &file.path_utf8) {
                (Some(name), Some(path)) if utf8 => (name, path.as_slice(), Some("utf-8")),
                _ => (
                    info.name
                        .as_ref()
                        .ok_or(InfoError::Malformed("missing name"))?,
                    file.path
                        .as_ref()
                        .ok_or(InfoError::Malformed("missing file path"))?
                        .as_slice(),
                    None,
                ),
            };

            rows.push(FileInfoRow {
                id: torrent_entry_id,
                file_index: index as i64,
                path: encode_path(name, path)?,
                encoding,
                start: offset,
                stop: offset + file.length,
            });
            offset += file.length;
        }
    } else {
        let length = info
            .length
            .ok_or(InfoError::Malformed("missing length and files"))?;
        let (name, encoding) = match &info.name_utf8 {
            Some(name) => (name, Some("utf-8")),
            None => (
                info.name
                    .as_ref()
                    .ok_or(InfoError::Malformed("missing name"))?,
                None,
            ),
        };

        rows.push(FileInfoRow {
            id: torrent_entry_id,
            file_index: 0,
            path: encode_path(name, &[])?,
            encoding,
            start: 0,
            stop: length,
        });
    }

    Ok(rows)
}

/// Derives and upserts `file_info` rows from a bencoded `info` dictionary.
pub struct TorrentInfoUpdate {
    rows: Vec<FileInfoRow>,
}

impl TorrentInfoUpdate {
    pub fn new(torrent_entry_id: i64, info: &[u8]) -> Result<TorrentInfoUpdate, InfoError> {
        let info: InfoDict = serde_bencode::from_bytes(info)?;
        Ok(TorrentInfoUpdate {
            rows: rows_from_info(torrent_entry_id, &info)?,
        })
    }
}

#[async_trait]
impl Apply for TorrentInfoUpdate {
    async fn apply(&self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        for chunk in self.rows.chunks(MAX_BINDINGS_PER_STATEMENT / 6) {
            let mut query = QueryBuilder::<Sqlite>::new(
                "insert into file_info (id, file_index, path, encoding, start, stop) ",
            );
            query.push_values(chunk, |mut bind, row| {
                bind.push_bind(row.id)
                    .push_bind(row.file_index)
                    .push_bind(row.path.as_slice())
                    .push_bind(row.encoding)
                    .push_bind(row.start)
                    .push_bind(row.stop);
            });
            query.push(
                " on conflict (id, file_index) do update set \
                 path = excluded.path, \
                 encoding = excluded.encoding, \
                 start = excluded.start, \
                 stop = excluded.stop",
            );
            query.build().persistent(false).execute(&mut *conn).await?;
        }
        Ok(())
    }
}

/// As [`TorrentInfoUpdate`], starting from a whole bencoded metafile.
pub struct TorrentFileUpdate {
    inner: TorrentInfoUpdate,
}

#[derive(Debug, Deserialize)]
struct MetaFile {
    info: InfoDict,
}

impl TorrentFileUpdate {
    pub fn new(torrent_entry_id: i64, torrent_file: &[u8]) -> Result<TorrentFileUpdate, InfoError> {
        let metafile: MetaFile = serde_bencode::from_bytes(torrent_file)?;
        Ok(TorrentFileUpdate {
            inner: TorrentInfoUpdate {
                rows: rows_from_info(torrent_entry_id, &metafile.info)?,
            },
        })
    }
}

#[async_trait]
impl Apply for TorrentFileUpdate {
    async fn apply(&self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        self.inner.apply(conn).await
    }
}
