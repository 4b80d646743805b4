//! Realtime invalidation: a background thread listening to the server-sent event stream of an
//! environment and refreshing the environment document whenever the server announces a newer
//! one.
use std::{
    io::{self, Read},
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use chrono::{DateTime, Utc};
use eventsource_stream::{EventStreamError, Eventsource};
use futures::{executor::block_on_stream, stream};
use url::Url;

use crate::{
    backoff::{Backoff, BackoffConfig},
    cancel::CancelSignal,
    fetcher::join_url,
    poller::Refresher,
    Error, Result,
};

/// Opens the event stream of an environment.
pub trait EventStreamConnector: Send + Sync {
    /// Connect to the stream of `environment_key` and return its raw body.
    fn connect(&self, environment_key: &str) -> Result<Box<dyn Read + Send>>;
}

/// Connects to `{realtime_url}sse/environments/{environment_key}/stream`.
#[derive(Debug)]
pub struct HttpEventStreamConnector {
    client: reqwest::blocking::Client,
    realtime_url: String,
}

impl HttpEventStreamConnector {
    /// Default bound on a silent stream. A stream quiet for longer is dropped and reconnected,
    /// which also bounds how long a stopped listener lingers.
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(realtime_url: impl Into<String>) -> Result<HttpEventStreamConnector> {
        HttpEventStreamConnector::with_idle_timeout(
            realtime_url,
            HttpEventStreamConnector::DEFAULT_IDLE_TIMEOUT,
        )
    }

    /// Create a connector whose reads fail once the stream has been silent for `idle_timeout`.
    pub fn with_idle_timeout(
        realtime_url: impl Into<String>,
        idle_timeout: Duration,
    ) -> Result<HttpEventStreamConnector> {
        let realtime_url = realtime_url.into();
        // Fail early on a bad base URL instead of on every reconnect.
        join_url(&realtime_url, "sse/")?;

        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("flag-engine/", env!("CARGO_PKG_VERSION")))
            .timeout(idle_timeout)
            .build()?;

        Ok(HttpEventStreamConnector {
            client,
            realtime_url,
        })
    }

    pub fn stream_url(&self, environment_key: &str) -> Result<Url> {
        join_url(
            &self.realtime_url,
            &format!("sse/environments/{environment_key}/stream"),
        )
    }
}

impl EventStreamConnector for HttpEventStreamConnector {
    fn connect(&self, environment_key: &str) -> Result<Box<dyn Read + Send>> {
        let url = self.stream_url(environment_key)?;
        log::debug!(target: "flag_engine", url:display = url; "connecting to event stream");

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::UnexpectedStatus(status.as_u16()));
        }

        Ok(Box::new(response))
    }
}

/// Blocking reads of a stream body, chunk by chunk, until end of file.
struct Chunks {
    reader: Box<dyn Read + Send>,
    buf: Box<[u8]>,
}

impl Chunks {
    fn new(reader: Box<dyn Read + Send>) -> Chunks {
        Chunks {
            reader,
            buf: vec![0; 8 * 1024].into_boxed_slice(),
        }
    }
}

impl Iterator for Chunks {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.reader.read(&mut self.buf) {
                Ok(0) => return None,
                Ok(n) => return Some(Ok(self.buf[..n].to_vec())),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    ) || err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
        .map_or(false, reqwest::Error::is_timeout)
}

/// Meaning of one server-sent event.
#[derive(Debug, Clone, Copy, PartialEq)]
enum StreamEvent {
    /// An event without data.
    Ignored,
    /// An event announcing an environment update at the given time.
    Updated(DateTime<Utc>),
    /// A well-formed event without a usable timestamp.
    Discarded,
}

/// Parse the data of one event. Only `{"updated_at": <seconds since epoch>}` payloads are
/// significant.
///
/// # Errors
///
/// [`Error::MalformedEvent`] if non-empty data is not valid JSON.
fn parse_event(data: &str) -> Result<StreamEvent> {
    if data.trim().is_empty() {
        return Ok(StreamEvent::Ignored);
    }

    let event: serde_json::Value =
        serde_json::from_str(data).map_err(|err| Error::MalformedEvent(Arc::new(err)))?;

    Ok(event
        .get("updated_at")
        .and_then(serde_json::Value::as_f64)
        .and_then(timestamp_from_secs)
        .map_or(StreamEvent::Discarded, StreamEvent::Updated))
}

/// Convert fractional seconds since epoch, rounded to microseconds. Non-positive or out of range
/// values yield `None`.
fn timestamp_from_secs(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() || secs <= 0.0 {
        return None;
    }
    let micros = (secs * 1_000_000.0).round();
    if micros >= i64::MAX as f64 {
        return None;
    }
    let micros = micros as i64;
    DateTime::from_timestamp(
        micros.div_euclid(1_000_000),
        (micros.rem_euclid(1_000_000) * 1_000) as u32,
    )
}

/// A realtime listener thread.
///
/// The listener connects to the event stream of the environment currently in the store and
/// refreshes the store whenever an event carries an `updated_at` strictly newer than the cached
/// document's. Disconnects and malformed events are reported to the error handler and followed by
/// a reconnect after a [`Backoff`] wait.
pub struct RealtimeListener {
    join_handle: JoinHandle<()>,
    cancel: CancelSignal,
}

impl RealtimeListener {
    /// Start the listener thread.
    ///
    /// # Errors
    ///
    /// IO error if the thread could not be spawned.
    pub fn start(
        connector: Arc<dyn EventStreamConnector>,
        refresher: Refresher,
        backoff: BackoffConfig,
    ) -> Result<RealtimeListener> {
        let cancel = CancelSignal::new();
        let join_handle = {
            let listener = Listener {
                connector,
                refresher,
                backoff: Backoff::new(backoff),
                cancel: cancel.clone(),
            };
            std::thread::Builder::new()
                .name("flag-engine-realtime".to_owned())
                .spawn(move || listener.run())?
        };

        Ok(RealtimeListener {
            join_handle,
            cancel,
        })
    }

    /// Stop the listener thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop the listener thread and block waiting for it to exit.
    ///
    /// Backoff waits are interrupted immediately, but a blocking read on an open stream is not:
    /// the thread exits once the stream yields data, closes, or stays idle past the connector's
    /// read timeout (see [`HttpEventStreamConnector::with_idle_timeout`]).
    pub fn shutdown(self) -> Result<()> {
        self.stop();
        self.join_handle
            .join()
            .map_err(|_| Error::PollerThreadPanicked)?;
        Ok(())
    }
}

/// State owned by the listener thread.
struct Listener {
    connector: Arc<dyn EventStreamConnector>,
    refresher: Refresher,
    backoff: Backoff,
    cancel: CancelSignal,
}

impl Listener {
    fn run(mut self) {
        while !self.cancel.is_cancelled() {
            match self.session() {
                Some(error) => {
                    log::warn!(target: "flag_engine", "realtime listener error: {:?}", error);
                    self.refresher.error_handler().handle_error(&error);
                }
                None if self.cancel.is_cancelled() => break,
                None => {}
            }

            if self.backoff.wait(&self.cancel) {
                break;
            }
        }
        log::debug!(target: "flag_engine", "realtime listener received stop command");
    }

    /// Connect and consume one stream. Returns the error that ended it, or `None` when there is
    /// nothing left to report (cancelled, or a refresh failure the refresher already reported).
    fn session(&mut self) -> Option<Error> {
        let snapshot = match self.refresher.store().get_environment() {
            Some(snapshot) => snapshot,
            None => {
                // The stream is scoped by the environment's api key, known only from a document.
                self.refresher.refresh().ok()?;
                self.refresher.store().get_environment()?
            }
        };
        let environment_key = snapshot.document().api_key.clone();

        let body = match self.connector.connect(&environment_key) {
            Ok(body) => body,
            Err(err) => return Some(err),
        };
        self.backoff.reset();
        log::debug!(target: "flag_engine", environment_key:display; "connected to event stream");

        let events = stream::iter(Chunks::new(body)).eventsource();
        for event in block_on_stream(events) {
            if self.cancel.is_cancelled() {
                return None;
            }
            let event = match event {
                Ok(event) => event,
                Err(EventStreamError::Transport(err)) if is_timeout(&err) => {
                    log::debug!(target: "flag_engine", "event stream idle, reconnecting");
                    return None;
                }
                Err(EventStreamError::Transport(err)) => return Some(err.into()),
                Err(err) => {
                    let err = io::Error::new(io::ErrorKind::InvalidData, err.to_string());
                    return Some(err.into());
                }
            };

            match parse_event(&event.data) {
                Ok(StreamEvent::Updated(updated_at)) => self.on_update(updated_at),
                Ok(StreamEvent::Discarded) => {
                    log::debug!(target: "flag_engine",
                                data:display = event.data;
                                "discarding event without a valid updated_at");
                }
                Ok(StreamEvent::Ignored) => {}
                Err(err) => return Some(err),
            }
        }

        if self.cancel.is_cancelled() {
            return None;
        }
        Some(Error::StreamClosed)
    }

    fn on_update(&self, updated_at: DateTime<Utc>) {
        let cached = self.refresher.store().updated_at();
        if cached.map_or(false, |cached| updated_at <= cached) {
            log::trace!(target: "flag_engine",
                        updated_at:display = updated_at;
                        "environment already up to date");
            return;
        }
        // Failures are reported by the refresher; the next event or poll tick retries.
        let _ = self.refresher.refresh();
    }
}
