use std::{path::PathBuf, sync::Arc, time::Duration};

use crate::{
    backoff::BackoffConfig,
    error_handler::{ErrorHandler, NoopErrorHandler},
    eval::EngineOptions,
    poller::PollerConfig,
    realtime::HttpEventStreamConnector,
    Client, Result,
};

/// Configuration for [`Client`].
///
/// # Examples
/// ```
/// # use std::time::Duration;
/// # use flag_engine::ClientConfig;
/// let config = ClientConfig::from_environment_key("ser.environment-key")
///     .refresh_interval(Duration::from_secs(30))
///     .realtime(true)
///     .error_handler(|err: &flag_engine::Error| {
///         eprintln!("flag environment refresh failed: {err}");
///     });
/// ```
pub struct ClientConfig {
    pub(crate) environment_key: String,
    pub(crate) api_url: String,
    pub(crate) realtime_url: String,
    pub(crate) poller: PollerConfig,
    pub(crate) realtime: bool,
    pub(crate) realtime_idle_timeout: Duration,
    pub(crate) offline_environment: Option<PathBuf>,
    pub(crate) error_handler: Arc<dyn ErrorHandler + Send + Sync>,
    pub(crate) engine_options: EngineOptions,
    pub(crate) backoff: BackoffConfig,
}

impl ClientConfig {
    /// Default base URL for API calls.
    pub const DEFAULT_API_URL: &'static str = "https://edge.api.flagsmith.com/api/v1/";

    /// Default base URL for the realtime event stream.
    pub const DEFAULT_REALTIME_URL: &'static str = "https://realtime.flagsmith.com/";

    /// Prefix of server-side environment keys. Only those are allowed to download the environment
    /// document.
    pub const SERVER_KEY_PREFIX: &'static str = "ser.";

    /// Create a default configuration using the specified environment key.
    ///
    /// ```
    /// # use flag_engine::ClientConfig;
    /// ClientConfig::from_environment_key("ser.environment-key");
    /// ```
    pub fn from_environment_key(environment_key: impl Into<String>) -> Self {
        ClientConfig {
            environment_key: environment_key.into(),
            api_url: ClientConfig::DEFAULT_API_URL.to_owned(),
            realtime_url: ClientConfig::DEFAULT_REALTIME_URL.to_owned(),
            poller: PollerConfig::default(),
            realtime: false,
            realtime_idle_timeout: HttpEventStreamConnector::DEFAULT_IDLE_TIMEOUT,
            offline_environment: None,
            error_handler: Arc::new(NoopErrorHandler),
            engine_options: EngineOptions::default(),
            backoff: BackoffConfig::default(),
        }
    }

    /// Override base URL for API calls. Clients should use the default setting in most cases.
    pub fn api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// Override base URL of the realtime event stream.
    pub fn realtime_url(mut self, realtime_url: impl Into<String>) -> Self {
        self.realtime_url = realtime_url.into();
        self
    }

    /// Interval between background refreshes of the environment document.
    ///
    /// Defaults to [`PollerConfig::DEFAULT_INTERVAL`].
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.poller.interval = interval;
        self
    }

    /// Upper bound on a single environment document request.
    ///
    /// Defaults to [`PollerConfig::DEFAULT_REQUEST_TIMEOUT`].
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.poller.request_timeout = timeout;
        self
    }

    /// Listen to the realtime event stream and refresh as soon as the environment changes.
    pub fn realtime(mut self, enabled: bool) -> Self {
        self.realtime = enabled;
        self
    }

    /// Drop and reconnect the realtime event stream after it has been silent this long. Also
    /// bounds how long the listener thread outlives [`Client::shutdown`].
    ///
    /// Defaults to [`HttpEventStreamConnector::DEFAULT_IDLE_TIMEOUT`].
    pub fn realtime_idle_timeout(mut self, timeout: Duration) -> Self {
        self.realtime_idle_timeout = timeout;
        self
    }

    /// Evaluate against a local environment document file instead of the API. The file is loaded
    /// once and no background thread is started.
    pub fn offline_environment(mut self, path: impl Into<PathBuf>) -> Self {
        self.offline_environment = Some(path.into());
        self
    }

    /// Set a hook receiving background refresh and realtime failures.
    pub fn error_handler(mut self, error_handler: impl ErrorHandler + Send + Sync + 'static) -> Self {
        self.error_handler = Arc::new(error_handler);
        self
    }

    pub fn engine_options(mut self, options: EngineOptions) -> Self {
        self.engine_options = options;
        self
    }

    /// Backoff applied between realtime reconnects.
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// ```no_run
    /// # use flag_engine::{ClientConfig, Client};
    /// let client: Client = ClientConfig::from_environment_key("ser.environment-key")
    ///     .to_client()
    ///     .unwrap();
    /// ```
    pub fn to_client(self) -> Result<Client> {
        Client::new(self)
    }
}
