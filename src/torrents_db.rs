use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::SqliteConnection;

use crate::metadata_db::InfoError;
use crate::storage::{Apply, Migrations};

pub const MIGRATIONS: Migrations = Migrations {
    application_id: 257675987,
    latest: 1_000_000,
    ddl: &["create table info (id integer primary key, info blob not null)"],
};

/// Stores the raw bencoded `info` dictionary for a torrent entry. An
/// existing row is left untouched; the dictionary is immutable content.
pub struct RawTorrentInfoUpdate {
    torrent_entry_id: i64,
    info: Vec<u8>,
}

impl RawTorrentInfoUpdate {
    pub fn new(torrent_entry_id: i64, info: Vec<u8>) -> RawTorrentInfoUpdate {
        RawTorrentInfoUpdate {
            torrent_entry_id,
            info,
        }
    }
}

#[async_trait]
impl Apply for RawTorrentInfoUpdate {
    async fn apply(&self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        sqlx::query("insert or ignore into info (id, info) values (?, ?)")
            .bind(self.torrent_entry_id)
            .bind(self.info.as_slice())
            .execute(conn)
            .await?;
        Ok(())
    }
}

/// As [`RawTorrentInfoUpdate`], starting from a whole bencoded metafile
/// whose `info` value is extracted and re-encoded.
pub struct RawTorrentFileUpdate {
    inner: RawTorrentInfoUpdate,
}

impl RawTorrentFileUpdate {
    pub fn new(
        torrent_entry_id: i64,
        torrent_file: &[u8],
    ) -> Result<RawTorrentFileUpdate, InfoError> {
        let mut metafile: HashMap<String, serde_bencode::value::Value> =
            serde_bencode::from_bytes(torrent_file)?;
        let info = metafile
            .remove("info")
            .ok_or(InfoError::Malformed("missing info"))?;

        Ok(RawTorrentFileUpdate {
            inner: RawTorrentInfoUpdate {
                torrent_entry_id,
                info: serde_bencode::to_bytes(&info)?,
            },
        })
    }
}

#[async_trait]
impl Apply for RawTorrentFileUpdate {
    async fn apply(&self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        self.inner.apply(conn).await
    }
}

#[cfg(test)]
mod tests {
    use sqlx::ConnectOptions;
    use sqlx::sqlite::SqliteConnectOptions;

    use super::*;

    async fn migrated_conn() -> SqliteConnection {
        let mut conn = SqliteConnectOptions::new()
            .in_memory(true)
            .connect()
            .await
            .unwrap();
        MIGRATIONS.upgrade(&mut conn).await.unwrap();
        conn
    }

    #[tokio::test]
    async fn stores_info_once() {
        let mut conn = migrated_conn().await;
        let info = b"d6:lengthi50e4:name4:roote".to_vec();

        RawTorrentInfoUpdate::new(7, info.clone())
            .apply(&mut conn)
            .await
            .unwrap();
        // A second write for the same id is ignored
        RawTorrentInfoUpdate::new(7, b"d6:lengthi99e4:name5:othere".to_vec())
            .apply(&mut conn)
            .await
            .unwrap();

        let stored: Vec<u8> = sqlx::query_scalar("select info from info where id = 7")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(stored, info);
    }

    #[tokio::test]
    async fn metafile_update_extracts_info() {
        let mut conn = migrated_conn().await;
        let torrent_file =
            b"d8:announce24:https://landof.tv/a/done4:infod6:lengthi50e4:name4:rootee";

        RawTorrentFileUpdate::new(9, torrent_file)
            .unwrap()
            .apply(&mut conn)
            .await
            .unwrap();

        let stored: Vec<u8> = sqlx::query_scalar("select info from info where id = 9")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(stored, b"d6:lengthi50e4:name4:roote".to_vec());
    }

    #[test]
    fn rejects_metafile_without_info() {
        let torrent_file = b"d8:announce24:https://landof.tv/a/donee";
        assert!(RawTorrentFileUpdate::new(9, torrent_file).is_err());
    }
}
