//! A background poller thread that periodically fetches the environment document and installs it
//! in the environment store.
use std::{sync::Arc, thread::JoinHandle, time::Duration};

use rand::{thread_rng, Rng};

use crate::{
    cancel::CancelSignal, environment_store::EnvironmentStore, error_handler::ErrorHandler,
    fetcher::EnvironmentFetcher, Error, Result,
};

/// Configuration for [`PollerThread`].
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    /// Interval to wait between refreshes.
    ///
    /// Defaults to [`PollerConfig::DEFAULT_INTERVAL`].
    pub interval: Duration,
    /// Upper bound on a single fetch attempt.
    ///
    /// Defaults to [`PollerConfig::DEFAULT_REQUEST_TIMEOUT`].
    pub request_timeout: Duration,
    /// Randomized duration subtracted from every interval, so that many instances started at the
    /// same time do not poll in lockstep.
    ///
    /// Defaults to zero (fixed interval).
    pub jitter: Duration,
}

impl PollerConfig {
    /// Default value for [`PollerConfig::interval`].
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
    /// Default value for [`PollerConfig::request_timeout`].
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new() -> PollerConfig {
        PollerConfig::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> PollerConfig {
        self.interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> PollerConfig {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> PollerConfig {
        self.jitter = jitter;
        self
    }
}

impl Default for PollerConfig {
    fn default() -> PollerConfig {
        PollerConfig {
            interval: PollerConfig::DEFAULT_INTERVAL,
            request_timeout: PollerConfig::DEFAULT_REQUEST_TIMEOUT,
            jitter: Duration::ZERO,
        }
    }
}

/// Performs one fetch-and-install cycle. Shared by the poller thread and the realtime listener.
///
/// The fetch runs outside of any lock; only the final install into the store is synchronized.
#[derive(Clone)]
pub struct Refresher {
    fetcher: Arc<dyn EnvironmentFetcher>,
    store: Arc<EnvironmentStore>,
    error_handler: Arc<dyn ErrorHandler + Send + Sync>,
    request_timeout: Duration,
}

impl Refresher {
    pub fn new(
        fetcher: Arc<dyn EnvironmentFetcher>,
        store: Arc<EnvironmentStore>,
        error_handler: Arc<dyn ErrorHandler + Send + Sync>,
        request_timeout: Duration,
    ) -> Refresher {
        Refresher {
            fetcher,
            store,
            error_handler,
            request_timeout,
        }
    }

    /// Fetch the environment document and install it unconditionally on success. Failures are
    /// logged, passed to the error handler, and returned.
    pub fn refresh(&self) -> Result<()> {
        log::debug!(target: "flag_engine", "fetching new environment document");
        match self.fetcher.fetch(self.request_timeout) {
            Ok(document) => {
                log::debug!(target: "flag_engine",
                            environment_key:display = document.api_key;
                            "successfully fetched environment document");
                self.store.set_environment(document);
                Ok(())
            }
            Err(err) => {
                log::warn!(target: "flag_engine", "error while fetching environment document: {:?}", err);
                self.error_handler.handle_error(&err);
                Err(err)
            }
        }
    }

    pub fn store(&self) -> &Arc<EnvironmentStore> {
        &self.store
    }

    pub(crate) fn error_handler(&self) -> &(dyn ErrorHandler + Send + Sync) {
        &*self.error_handler
    }
}

/// An environment poller thread.
///
/// [`PollerThread::start`] performs one synchronous refresh, then keeps refreshing in the
/// background every [`PollerConfig::interval`] until stopped. Failed refreshes leave the
/// previously installed document in place and are retried on the next tick.
pub struct PollerThread {
    join_handle: JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    cancel: CancelSignal,

    /// Result of the synchronous refresh performed by [`PollerThread::start`].
    initial_result: Result<()>,
}

impl PollerThread {
    /// Refresh once, then start the poller thread.
    ///
    /// A failed initial refresh does not prevent the thread from starting. The environment store
    /// stays empty until a later tick succeeds, see [`PollerThread::initial_result`].
    ///
    /// # Errors
    ///
    /// IO error if the thread could not be spawned.
    pub fn start(refresher: Refresher, config: &PollerConfig) -> Result<PollerThread> {
        let initial_result = refresher.refresh();

        let cancel = CancelSignal::new();
        let join_handle = {
            let cancel = cancel.clone();
            let interval = config.interval;
            let jitter_max = config.jitter;

            std::thread::Builder::new()
                .name("flag-engine-poller".to_owned())
                .spawn(move || {
                    while !cancel.wait_timeout(jitter(interval, jitter_max)) {
                        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            // Errors were already reported by the refresher; retry on the next tick.
                            let _ = refresher.refresh();
                        }));

                        // If catch_unwind returns Err, the fetcher or the error handler panicked.
                        if result.is_err() {
                            log::warn!(target: "flag_engine", "panic while refreshing environment document");
                            refresher.error_handler().handle_error(&Error::PollerThreadPanicked);
                        }
                    }
                    log::debug!(target: "flag_engine", "poller thread received stop command");
                })?
        };

        Ok(PollerThread {
            join_handle,
            cancel,
            initial_result,
        })
    }

    /// Result of the initial synchronous refresh.
    pub fn initial_result(&self) -> Result<()> {
        self.initial_result.clone()
    }

    /// Stop the poller thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop the poller thread and block waiting for it to exit.
    ///
    /// An in-flight fetch is not interrupted, so this may block for up to
    /// [`PollerConfig::request_timeout`]. If you don't need to wait for the thread to exit, use
    /// [`PollerThread::stop`] instead.
    pub fn shutdown(self) -> Result<()> {
        // Send stop signal in case it wasn't sent before.
        self.stop();

        // Error means that the thread has panicked and there's nothing useful we can do in that
        // case.
        self.join_handle
            .join()
            .map_err(|_| Error::PollerThreadPanicked)?;

        Ok(())
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}
