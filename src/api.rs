use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, warn};
use url::Url;

use crate::ratelimit::{ApiRateLimiter, GatedClient, RequestError, WouldBlock};

mod de;
pub mod types;

pub use types::{GetTorrentsResult, GetUserSnatchlistResult, SnatchEntry, TorrentEntry};

pub const ENDPOINT: &str = "https://api.broadcasthe.net/";

/// One page's worth of "everything", used by the sweep scrapers.
pub const ALL_RESULTS: i64 = 1 << 31;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid API key: {0}")]
    InvalidApiKey(String),
    #[error("call limit exceeded: {0}")]
    CallLimitExceeded(String),
    #[error("API error code {code}: {message}")]
    Api { code: i64, message: String },
    #[error("malformed API response: {0}")]
    Protocol(String),
    #[error(transparent)]
    WouldBlock(#[from] WouldBlock),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl Error {
    fn from_code(code: i64, message: String) -> Error {
        match code {
            types::INVALID_API_KEY => Error::InvalidApiKey(message),
            types::CALL_LIMIT_EXCEEDED => Error::CallLimitExceeded(message),
            _ => Error::Api { code, message },
        }
    }
}

/// JSON-RPC client for the tracker API, gated through the shared call-quota
/// limiter. A `CallLimitExceeded` reply additionally slams the local
/// limiter to zero so our view reconverges with the server's.
pub struct RateLimitedApi {
    key: String,
    endpoint: Url,
    http: GatedClient<ApiRateLimiter>,
    timeout: Duration,
}

impl RateLimitedApi {
    pub fn new(key: impl Into<String>, http: GatedClient<ApiRateLimiter>) -> RateLimitedApi {
        RateLimitedApi {
            key: key.into(),
            endpoint: Url::parse(ENDPOINT).expect("API endpoint URL"),
            http,
            timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn with_endpoint(mut self, endpoint: Url) -> RateLimitedApi {
        self.endpoint = endpoint;
        self
    }

    pub fn rate_limiter(&self) -> &Arc<ApiRateLimiter> {
        self.http.limiter()
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, Error> {
        let mut params = params;
        params.insert(0, Value::String(self.key.clone()));

        let envelope = types::Request {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };

        let request = self
            .http
            .http()
            .post(self.endpoint.clone())
            .timeout(self.timeout)
            .json(&envelope)
            .build()?;

        let response = match self.http.execute(request).await {
            Ok(response) => response,
            Err(RequestError::WouldBlock(would_block)) => return Err(would_block.into()),
            Err(RequestError::Http(err)) => return Err(err.into()),
        };

        let response = response.error_for_status()?;
        let body: types::Response = response.json().await?;

        if let Some(api_error) = body.error {
            error!(
                "{method}: error code {}: {}",
                api_error.code, api_error.message
            );
            let err = Error::from_code(api_error.code, api_error.message);
            if matches!(err, Error::CallLimitExceeded(_)) {
                self.rate_limiter().set_remaining(0);
            }
            return Err(err);
        }

        body.result
            .ok_or_else(|| Error::Protocol("response has neither result nor error".into()))
    }

    /// `getTorrents(filters, results, offset)`.
    pub async fn get_torrents(
        &self,
        filters: Value,
        results: i64,
        offset: i64,
    ) -> Result<GetTorrentsResult, Error> {
        let raw = self
            .call("getTorrents", vec![filters, json!(results), json!(offset)])
            .await?;
        let result: GetTorrentsResult =
            serde_json::from_value(raw).map_err(|err| Error::Protocol(err.to_string()))?;

        debug!(
            "getTorrents: got {} entries, {} total",
            result.torrents.len(),
            result.results
        );
        warn_unknown_keys(
            "torrent",
            result.torrents.values().map(|entry| &entry.extra),
        );

        Ok(result)
    }

    /// `getUserSnatchlist(results, offset)`.
    pub async fn get_user_snatchlist(
        &self,
        results: i64,
        offset: i64,
    ) -> Result<GetUserSnatchlistResult, Error> {
        let raw = self
            .call("getUserSnatchlist", vec![json!(results), json!(offset)])
            .await?;
        let result: GetUserSnatchlistResult =
            serde_json::from_value(raw).map_err(|err| Error::Protocol(err.to_string()))?;

        debug!(
            "getUserSnatchlist: got {} entries, {} total",
            result.snatches.len(),
            result.results
        );
        warn_unknown_keys(
            "snatchlist",
            result.snatches.values().map(|entry| &entry.extra),
        );

        Ok(result)
    }
}

fn warn_unknown_keys<'a>(
    kind: &str,
    extras: impl Iterator<Item = &'a std::collections::BTreeMap<String, Value>>,
) {
    let unknown: BTreeSet<&str> = extras
        .flat_map(|extra| extra.keys())
        .map(String::as_str)
        .collect();

    if !unknown.is_empty() {
        warn!(
            "{kind} entry has unrecognized keys {unknown:?}; \
             we may need to update our parsing logic"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_map_to_kinds() {
        assert!(matches!(
            Error::from_code(-32001, "bad key".into()),
            Error::InvalidApiKey(_)
        ));
        assert!(matches!(
            Error::from_code(-32002, "slow down".into()),
            Error::CallLimitExceeded(_)
        ));
        assert!(matches!(
            Error::from_code(-32099, "other".into()),
            Error::Api { code: -32099, .. }
        ));
    }

    #[test]
    fn request_envelope_shape() {
        let envelope = types::Request {
            jsonrpc: "2.0",
            id: 1,
            method: "getTorrents",
            params: vec![json!("key"), json!({}), json!(10), json!(0)],
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "getTorrents");
        assert_eq!(value["params"][0], "key");
    }
}
