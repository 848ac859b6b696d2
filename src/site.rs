use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::ratelimit::{GatedClient, RateLimiter, RequestError};

pub const SITE: &str = "https://broadcasthe.net";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Credentials for the authenticated site endpoints, normally read from
/// `auth.json` in the cache directory. Every field is optional at load
/// time; each endpoint checks for the fields it needs before building a
/// request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserAuth {
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub authkey: Option<String>,
    #[serde(default)]
    pub passkey: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("missing auth field: {0}")]
    MissingAuth(&'static str),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Http(reqwest::Error),
}

/// Authenticated access to the non-API site endpoints, gated through the
/// generic site-request limiter.
pub struct UserAccess {
    auth: UserAuth,
    base: Url,
    http: GatedClient<RateLimiter>,
    timeout: Duration,
}

impl UserAccess {
    pub fn new(auth: UserAuth, http: GatedClient<RateLimiter>) -> UserAccess {
        UserAccess {
            auth,
            base: Url::parse(SITE).expect("site URL"),
            http,
            timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn with_base(mut self, base: Url) -> UserAccess {
        self.base = base;
        self
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        self.http.limiter()
    }

    /// Fetches a named feed from `feeds.php` and returns its XML body.
    pub async fn get_feed(&self, name: &str) -> Result<String, Error> {
        let user_id = self.auth.user_id.ok_or(Error::MissingAuth("user_id"))?;
        let auth = self.auth.auth.as_deref().ok_or(Error::MissingAuth("auth"))?;
        let authkey = self
            .auth
            .authkey
            .as_deref()
            .ok_or(Error::MissingAuth("authkey"))?;
        let passkey = self
            .auth
            .passkey
            .as_deref()
            .ok_or(Error::MissingAuth("passkey"))?;

        let mut url = self.base.join("/feeds.php").expect("feeds URL");
        url.query_pairs_mut()
            .append_pair("feed", name)
            .append_pair("user", &user_id.to_string())
            .append_pair("auth", auth)
            .append_pair("passkey", passkey)
            .append_pair("authkey", authkey);

        let request = self
            .http
            .http()
            .get(url)
            .timeout(self.timeout)
            .build()
            .map_err(Error::Http)?;
        let response = self.http.execute(request).await?;
        let response = response.error_for_status().map_err(Error::Http)?;

        response.text().await.map_err(Error::Http)
    }

    /// Downloads the bencoded metafile for a torrent entry from
    /// `torrents.php`.
    pub async fn get_torrent(&self, torrent_entry_id: i64) -> Result<Vec<u8>, Error> {
        let passkey = self
            .auth
            .passkey
            .as_deref()
            .ok_or(Error::MissingAuth("passkey"))?;

        let mut url = self.base.join("/torrents.php").expect("torrents URL");
        url.query_pairs_mut()
            .append_pair("action", "download")
            .append_pair("id", &torrent_entry_id.to_string())
            .append_pair("torrent_pass", passkey);

        let request = self
            .http
            .http()
            .get(url)
            .timeout(self.timeout)
            .build()
            .map_err(Error::Http)?;
        let response = self.http.execute(request).await?;
        let response = response.error_for_status().map_err(Error::Http)?;

        Ok(response.bytes().await.map_err(Error::Http)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access(auth: UserAuth) -> UserAccess {
        let limiter = Arc::new(RateLimiter::new(
            RateLimiter::DEFAULT_RATE,
            RateLimiter::DEFAULT_BURST,
        ));
        UserAccess::new(
            auth,
            GatedClient::new(reqwest::Client::new(), SITE, limiter),
        )
    }

    #[tokio::test]
    async fn get_feed_requires_auth_fields() {
        let user_access = access(UserAuth {
            user_id: Some(12345),
            auth: Some("dummy_auth".into()),
            authkey: None,
            passkey: Some("dummy_passkey".into()),
            api_key: None,
        });

        match user_access.get_feed("torrents_all").await {
            Err(Error::MissingAuth("authkey")) => {}
            other => panic!("expected missing authkey, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_torrent_requires_passkey() {
        let user_access = access(UserAuth::default());

        match user_access.get_torrent(123).await {
            Err(Error::MissingAuth("passkey")) => {}
            other => panic!("expected missing passkey, got {other:?}"),
        }
    }
}
