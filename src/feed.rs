use serde::Deserialize;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed feed: {0}")]
    Xml(#[from] quick_xml::DeError),
}

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    #[serde(default)]
    link: String,
}

/// Extracts torrent-entry ids from a site feed, in feed order.
///
/// Each item's link carries the entry id as an `id` query parameter; items
/// whose link has no parseable id are skipped.
pub fn parse_ids(xml: &str) -> Result<Vec<i64>, Error> {
    let rss: Rss = quick_xml::de::from_str(xml)?;

    Ok(rss
        .channel
        .items
        .iter()
        .filter_map(|item| id_from_link(&item.link))
        .collect())
}

fn id_from_link(link: &str) -> Option<i64> {
    let url = Url::parse(link).ok()?;
    let id = url
        .query_pairs()
        .find(|(key, _)| key == "id")
        .map(|(_, value)| value.into_owned())?;

    id.parse().ok()
}
