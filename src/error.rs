use std::sync::Arc;

use thiserror::Error;

/// Result type used by the fallible (I/O facing) parts of the crate.
///
/// Flag evaluation itself never fails: malformed rules or literals resolve to "no match".
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors of environment fetching, caching, and client usage.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// No environment document has been installed yet, so local evaluation is impossible. Callers
    /// should fall back to a remote call or a default value.
    #[error("no local environment available")]
    NoLocalEnvironment,

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// Local evaluation requires a server-side environment key.
    #[error("local evaluation requires a server-side environment key")]
    InvalidEnvironmentKey,

    /// The request was unauthorized, possibly due to an invalid environment key.
    #[error("unauthorized, environment key is likely invalid")]
    Unauthorized,

    /// The server answered with an unexpected status code.
    #[error("unexpected response status: {0}")]
    UnexpectedStatus(u16),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// The environment document could not be parsed.
    #[error("error parsing environment document")]
    EnvironmentParse(#[source] Arc<serde_json::Error>),

    /// A realtime event that is not valid JSON.
    #[error("malformed realtime event")]
    MalformedEvent(#[source] Arc<serde_json::Error>),

    /// The realtime event stream ended.
    #[error("event stream closed")]
    StreamClosed,

    /// Indicates that the poller thread panicked. This should normally never happen.
    #[error("poller thread panicked")]
    PollerThreadPanicked,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}
