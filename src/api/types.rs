use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::de;

pub const INVALID_API_KEY: i64 = -32001;
pub const CALL_LIMIT_EXCEEDED: i64 = -32002;

/// JSON-RPC 2.0 request envelope. The API key is always the first element
/// of `params`.
#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'a str,
    pub id: u32,
    pub method: &'a str,
    pub params: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ResponseError>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
}

/// One torrent entry as returned by `getTorrents`. Numeric fields arrive as
/// decimal strings and are typed at the serde boundary; textual fields are
/// kept verbatim and normalized later by the database operators.
#[derive(Debug, Clone, Deserialize)]
pub struct TorrentEntry {
    #[serde(rename = "TorrentID", deserialize_with = "de::stringified")]
    pub id: i64,
    #[serde(rename = "GroupID", deserialize_with = "de::stringified")]
    pub group_id: i64,
    #[serde(rename = "SeriesID", deserialize_with = "de::stringified")]
    pub series_id: i64,
    #[serde(rename = "Category", default)]
    pub category: String,
    #[serde(rename = "Codec", default)]
    pub codec: String,
    #[serde(rename = "Container", default)]
    pub container: String,
    #[serde(rename = "DownloadURL", default)]
    pub download_url: String,
    #[serde(rename = "GroupName", default)]
    pub group_name: String,
    #[serde(rename = "ImdbID", default)]
    pub imdb_id: String,
    #[serde(rename = "InfoHash", default)]
    pub info_hash: String,
    #[serde(rename = "Leechers", deserialize_with = "de::stringified")]
    pub leechers: i64,
    #[serde(rename = "Origin", default)]
    pub origin: String,
    #[serde(rename = "ReleaseName", default)]
    pub release_name: String,
    #[serde(rename = "Resolution", default)]
    pub resolution: String,
    #[serde(rename = "Seeders", deserialize_with = "de::stringified")]
    pub seeders: i64,
    #[serde(rename = "Series", default)]
    pub series: String,
    #[serde(rename = "SeriesBanner", default)]
    pub series_banner: String,
    #[serde(rename = "SeriesPoster", default)]
    pub series_poster: String,
    #[serde(rename = "Size", deserialize_with = "de::stringified")]
    pub size: i64,
    #[serde(rename = "Snatched", deserialize_with = "de::stringified")]
    pub snatched: i64,
    #[serde(rename = "Source", default)]
    pub source: String,
    #[serde(rename = "Time", deserialize_with = "de::stringified")]
    pub time: i64,
    #[serde(rename = "TvdbID", default)]
    pub tvdb_id: String,
    #[serde(rename = "TvrageID", default)]
    pub tvrage_id: String,
    #[serde(rename = "YoutubeTrailer", default)]
    pub youtube_trailer: String,
    /// Keys we do not recognize; non-empty means our parsing logic may need
    /// an update.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct GetTorrentsResult {
    #[serde(rename = "results", deserialize_with = "de::stringified")]
    pub results: i64,
    #[serde(default)]
    pub torrents: IndexMap<String, TorrentEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnatchEntryTorrentInfo {
    #[serde(rename = "GroupName", default)]
    pub group_name: String,
    #[serde(rename = "Series", default)]
    pub series: String,
    #[serde(rename = "Year", default)]
    pub year: String,
    #[serde(rename = "Source", default)]
    pub source: String,
    #[serde(rename = "Container", default)]
    pub container: String,
    #[serde(rename = "Codec", default)]
    pub codec: String,
    #[serde(rename = "Resolution", default)]
    pub resolution: String,
}

/// One record of the user's snatch list as returned by `getUserSnatchlist`.
#[derive(Debug, Clone, Deserialize)]
pub struct SnatchEntry {
    #[serde(rename = "TorrentID", deserialize_with = "de::stringified")]
    pub id: i64,
    #[serde(rename = "Downloaded", deserialize_with = "de::stringified")]
    pub downloaded: i64,
    #[serde(rename = "Uploaded", deserialize_with = "de::stringified")]
    pub uploaded: i64,
    #[serde(rename = "Ratio", default)]
    pub ratio: String,
    #[serde(rename = "Seedtime", deserialize_with = "de::stringified")]
    pub seed_time: i64,
    #[serde(rename = "IsSeeding", deserialize_with = "de::stringified")]
    pub is_seeding: i64,
    /// `YYYY-MM-DD HH:MM:SS`, implicitly UTC.
    #[serde(rename = "SnatchTime", default)]
    pub snatch_time: String,
    #[serde(rename = "TorrentInfo", default)]
    pub torrent_info: Option<SnatchEntryTorrentInfo>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct GetUserSnatchlistResult {
    #[serde(rename = "results", deserialize_with = "de::stringified")]
    pub results: i64,
    #[serde(rename = "torrents", default)]
    pub snatches: IndexMap<String, SnatchEntry>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn torrent_entry_stringified_numerics() {
        let entry: TorrentEntry = serde_json::from_value(json!({
            "Category": "Episode",
            "Codec": "H.264",
            "Container": "MKV",
            "DownloadURL": "https://example.com/unused",
            "GroupID": "234",
            "GroupName": "S01E01",
            "ImdbID": "1234567",
            "InfoHash": "F".repeat(40),
            "Leechers": "1",
            "Origin": "P2P",
            "ReleaseName": "example.s01e01.coolkids",
            "Resolution": "1080p",
            "Seeders": "10",
            "Series": "Example",
            "SeriesBanner": "https://example.com/banner.jpg",
            "SeriesID": "345",
            "SeriesPoster": "https://example.com/poster.jpg",
            "Size": "12345678",
            "Snatched": "100",
            "Source": "HDTV",
            "Time": "123456789",
            "TorrentID": "123",
            "TvdbID": "456",
            "TvrageID": "567",
            "YoutubeTrailer": "0",
        }))
        .unwrap();

        assert_eq!(entry.id, 123);
        assert_eq!(entry.group_id, 234);
        assert_eq!(entry.series_id, 345);
        assert_eq!(entry.size, 12_345_678);
        assert_eq!(entry.time, 123_456_789);
        assert!(entry.extra.is_empty());
    }

    #[test]
    fn torrent_entry_collects_unknown_keys() {
        let entry: TorrentEntry = serde_json::from_value(json!({
            "TorrentID": "1",
            "GroupID": "2",
            "SeriesID": "3",
            "Leechers": "0",
            "Seeders": "0",
            "Size": "0",
            "Snatched": "0",
            "Time": "0",
            "BrandNewField": "surprise",
        }))
        .unwrap();

        assert_eq!(entry.extra.keys().collect::<Vec<_>>(), ["BrandNewField"]);
    }

    #[test]
    fn snatch_entry_parses() {
        let entry: SnatchEntry = serde_json::from_value(json!({
            "TorrentID": "100",
            "Downloaded": "1000",
            "Uploaded": "2000",
            "Ratio": "---",
            "Seedtime": "86400",
            "IsSeeding": "1",
            "SnatchTime": "2000-01-01 01:02:03",
            "TorrentInfo": { "GroupName": "S01E01", "Series": "Example" },
        }))
        .unwrap();

        assert_eq!(entry.id, 100);
        assert_eq!(entry.seed_time, 86_400);
        assert_eq!(entry.is_seeding, 1);
        assert_eq!(entry.torrent_info.unwrap().series, "Example");
    }

    #[test]
    fn get_torrents_result_defaults_to_empty() {
        let result: GetTorrentsResult = serde_json::from_value(json!({ "results": "0" })).unwrap();
        assert_eq!(result.results, 0);
        assert!(result.torrents.is_empty());
    }
}
