//! Sources of environment documents.
use std::{
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use reqwest::StatusCode;
use url::Url;

use crate::{environment::EnvironmentDocument, Error, Result};

/// Fetch capability used by the refresh loop and the realtime listener.
///
/// Implementations must be safe to call repeatedly and from several threads. Errors are reported
/// to the caller; retrying is the caller's business.
///
/// The trait is implemented for closures, which is handy in tests:
/// ```
/// # use std::time::Duration;
/// # use flag_engine::{EnvironmentDocument, EnvironmentFetcher, Error};
/// let fetcher = |_timeout: Duration| -> flag_engine::Result<EnvironmentDocument> {
///     Err(Error::Unauthorized)
/// };
/// assert!(fetcher.fetch(Duration::from_secs(1)).is_err());
/// ```
pub trait EnvironmentFetcher: Send + Sync {
    /// Fetch the current environment document. `timeout` bounds the whole attempt.
    fn fetch(&self, timeout: Duration) -> Result<EnvironmentDocument>;
}

impl<F> EnvironmentFetcher for F
where
    F: Fn(Duration) -> Result<EnvironmentDocument> + Send + Sync,
{
    fn fetch(&self, timeout: Duration) -> Result<EnvironmentDocument> {
        self(timeout)
    }
}

const ENVIRONMENT_DOCUMENT_ENDPOINT: &str = "environment-document/";
pub(crate) const ENVIRONMENT_KEY_HEADER: &str = "X-Environment-Key";

/// Fetches the environment document from the API.
///
/// Once the server answers `401 Unauthorized`, the key is known to be bad and every further call
/// fails with [`Error::Unauthorized`] without touching the network.
#[derive(Debug)]
pub struct HttpEnvironmentFetcher {
    client: reqwest::blocking::Client,
    url: Url,
    environment_key: String,
    unauthorized: AtomicBool,
}

impl HttpEnvironmentFetcher {
    pub fn new(api_url: &str, environment_key: impl Into<String>) -> Result<HttpEnvironmentFetcher> {
        let url = join_url(api_url, ENVIRONMENT_DOCUMENT_ENDPOINT)?;
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("flag-engine/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(HttpEnvironmentFetcher {
            client,
            url,
            environment_key: environment_key.into(),
            unauthorized: AtomicBool::new(false),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl EnvironmentFetcher for HttpEnvironmentFetcher {
    fn fetch(&self, timeout: Duration) -> Result<EnvironmentDocument> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }

        log::debug!(target: "flag_engine", url:display = self.url; "fetching environment document");
        let response = self
            .client
            .get(self.url.clone())
            .header(ENVIRONMENT_KEY_HEADER, &self.environment_key)
            .timeout(timeout)
            .send()?;

        match response.status() {
            status if status.is_success() => {
                let body = response.bytes()?;
                EnvironmentDocument::from_json(&body)
            }
            StatusCode::UNAUTHORIZED => {
                log::warn!(target: "flag_engine", "client is not authorized. Check your environment key");
                self.unauthorized.store(true, Ordering::Relaxed);
                Err(Error::Unauthorized)
            }
            status => Err(Error::UnexpectedStatus(status.as_u16())),
        }
    }
}

/// Reads the environment document from a local JSON file on every call.
#[derive(Debug, Clone)]
pub struct FileEnvironmentFetcher {
    path: PathBuf,
}

impl FileEnvironmentFetcher {
    pub fn new(path: impl Into<PathBuf>) -> FileEnvironmentFetcher {
        FileEnvironmentFetcher { path: path.into() }
    }
}

impl EnvironmentFetcher for FileEnvironmentFetcher {
    fn fetch(&self, _timeout: Duration) -> Result<EnvironmentDocument> {
        let json = std::fs::read(&self.path)?;
        EnvironmentDocument::from_json(&json)
    }
}

/// Resolve `path` relative to `base`, treating `base` as a directory even without a trailing
/// slash.
pub(crate) fn join_url(base: &str, path: &str) -> Result<Url> {
    let base = if base.ends_with('/') {
        Url::parse(base)
    } else {
        Url::parse(&format!("{base}/"))
    }
    .map_err(Error::InvalidBaseUrl)?;
    base.join(path).map_err(Error::InvalidBaseUrl)
}
