use std::{collections::HashMap, sync::Arc};

use crate::{
    context::{FlagResult, SegmentResult, SegmentSource, Traits},
    environment_store::{EnvironmentSnapshot, EnvironmentStore},
    eval::Engine,
    fetcher::{EnvironmentFetcher, FileEnvironmentFetcher, HttpEnvironmentFetcher},
    mapper,
    poller::{PollerThread, Refresher},
    realtime::{HttpEventStreamConnector, RealtimeListener},
    ClientConfig, Error, Result, Value,
};

/// A client evaluating flags locally against a self-refreshing copy of the environment document.
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// # Examples
/// ```no_run
/// # use flag_engine::{Client, ClientConfig, Traits, Value};
/// let client = Client::new(ClientConfig::from_environment_key("ser.environment-key")).unwrap();
///
/// let traits: Traits = [("plan".to_owned(), Value::from("premium"))].into();
/// let flags = client.get_identity_flags("user-1", &traits).unwrap();
/// if flags.is_feature_enabled("new_checkout") {
///     // ...
/// }
/// ```
pub struct Client {
    store: Arc<EnvironmentStore>,
    engine: Engine,
    poller: Option<PollerThread>,
    realtime: Option<RealtimeListener>,
}

impl Client {
    /// Create a new `Client` using the specified configuration.
    ///
    /// Performs one synchronous fetch before returning (see [`PollerThread::start`]). A failed
    /// initial fetch is not an error: the client starts with an empty environment and evaluation
    /// returns [`Error::NoLocalEnvironment`] until a background refresh succeeds.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidEnvironmentKey`] if the key is not a server-side key and no offline
    ///   environment is configured.
    /// - [`Error::InvalidBaseUrl`] on a malformed API or realtime URL.
    /// - Any fetch error when loading an offline environment file.
    pub fn new(config: ClientConfig) -> Result<Client> {
        if let Some(path) = &config.offline_environment {
            let fetcher = Arc::new(FileEnvironmentFetcher::new(path.clone()));
            return Client::offline(config, fetcher);
        }

        if !config.environment_key.starts_with(ClientConfig::SERVER_KEY_PREFIX) {
            return Err(Error::InvalidEnvironmentKey);
        }

        let fetcher = Arc::new(HttpEnvironmentFetcher::new(
            &config.api_url,
            config.environment_key.clone(),
        )?);
        Client::with_fetcher(config, fetcher)
    }

    /// Create a `Client` refreshing from a custom fetcher. The environment key of `config` is not
    /// checked, and its offline environment setting is ignored.
    pub fn with_fetcher(config: ClientConfig, fetcher: Arc<dyn EnvironmentFetcher>) -> Result<Client> {
        let store = Arc::new(EnvironmentStore::new());
        let refresher = Refresher::new(
            fetcher,
            store.clone(),
            config.error_handler.clone(),
            config.poller.request_timeout,
        );

        let poller = PollerThread::start(refresher.clone(), &config.poller)?;
        if let Err(err) = poller.initial_result() {
            log::warn!(target: "flag_engine", "starting without a local environment: {:?}", err);
        }

        let realtime = if config.realtime {
            let connector = Arc::new(HttpEventStreamConnector::with_idle_timeout(
                config.realtime_url.clone(),
                config.realtime_idle_timeout,
            )?);
            Some(RealtimeListener::start(connector, refresher, config.backoff)?)
        } else {
            None
        };

        Ok(Client {
            store,
            engine: Engine::new().with_options(config.engine_options),
            poller: Some(poller),
            realtime,
        })
    }

    /// Load the environment once from `fetcher` and never refresh it.
    pub fn offline(config: ClientConfig, fetcher: Arc<dyn EnvironmentFetcher>) -> Result<Client> {
        let store = Arc::new(EnvironmentStore::new());
        store.set_environment(fetcher.fetch(config.poller.request_timeout)?);

        Ok(Client {
            store,
            engine: Engine::new().with_options(config.engine_options),
            poller: None,
            realtime: None,
        })
    }

    fn snapshot(&self) -> Result<Arc<EnvironmentSnapshot>> {
        self.store.get_environment().ok_or_else(|| {
            log::warn!(target: "flag_engine", "evaluating flags before the environment has been fetched");
            Error::NoLocalEnvironment
        })
    }

    /// Evaluate every flag of the environment, without an identity.
    pub fn get_environment_flags(&self) -> Result<Flags> {
        let snapshot = self.snapshot()?;
        let result = self.engine.evaluate(snapshot.context());
        Ok(Flags::new(
            result.flags,
            snapshot.document().hide_disabled_flags(),
        ))
    }

    /// Evaluate every flag of the environment for the identity `identifier` with `traits`.
    pub fn get_identity_flags(&self, identifier: &str, traits: &Traits) -> Result<Flags> {
        let snapshot = self.snapshot()?;
        let ctx = mapper::identity_context(
            snapshot.context(),
            identifier,
            traits,
            snapshot.identity_override(identifier),
        );
        let result = self.engine.evaluate(&ctx);

        log::trace!(target: "flag_engine",
                    identifier,
                    traits:serde;
                    "evaluated identity flags");

        Ok(Flags::new(
            result.flags,
            snapshot.document().hide_disabled_flags(),
        ))
    }

    /// Segments of the environment the identity belongs to. Identity overrides are not reported
    /// as segments.
    pub fn get_identity_segments(
        &self,
        identifier: &str,
        traits: &Traits,
    ) -> Result<Vec<SegmentResult>> {
        let snapshot = self.snapshot()?;
        let ctx = mapper::identity_context(
            snapshot.context(),
            identifier,
            traits,
            snapshot.identity_override(identifier),
        );
        let mut segments = self.engine.evaluate(&ctx).segments;
        segments.retain(|segment| {
            segment.metadata.as_ref().map(|metadata| metadata.source)
                != Some(SegmentSource::IdentityOverrides)
        });
        Ok(segments)
    }

    /// Stop background threads, waiting for the poller thread to exit.
    ///
    /// The realtime listener is only signalled: it may be blocked reading the stream, which it
    /// notices at the latest after [`ClientConfig::realtime_idle_timeout`].
    pub fn shutdown(mut self) -> Result<()> {
        if let Some(realtime) = self.realtime.take() {
            realtime.stop();
        }
        if let Some(poller) = self.poller.take() {
            poller.shutdown()?;
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(realtime) = &self.realtime {
            realtime.stop();
        }
        if let Some(poller) = &self.poller {
            poller.stop();
        }
    }
}

/// Evaluated flags, keyed by feature name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Flags {
    flags: HashMap<String, FlagResult>,
}

impl Flags {
    fn new(mut flags: HashMap<String, FlagResult>, hide_disabled_flags: bool) -> Flags {
        if hide_disabled_flags {
            flags.retain(|_, flag| flag.enabled);
        }
        Flags { flags }
    }

    pub fn get_flag(&self, feature_name: &str) -> Option<&FlagResult> {
        self.flags.get(feature_name)
    }

    /// Returns `false` for unknown features.
    pub fn is_feature_enabled(&self, feature_name: &str) -> bool {
        self.get_flag(feature_name).map_or(false, |flag| flag.enabled)
    }

    pub fn get_feature_value(&self, feature_name: &str) -> Option<&Value> {
        self.get_flag(feature_name)?.value.as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlagResult> {
        self.flags.values()
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use crate::{
        context::Traits, environment::EnvironmentDocument, fetcher::FileEnvironmentFetcher,
        Client, ClientConfig, Error, Result, Value,
    };

    const FIXTURE: &str = "tests/data/environment.json";

    fn traits<const N: usize>(pairs: [(&str, &str); N]) -> Traits {
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_owned(), Value::from(v)))
            .collect()
    }

    fn offline_client() -> Client {
        ClientConfig::from_environment_key("client-side-key")
            .offline_environment(FIXTURE)
            .to_client()
            .unwrap()
    }

    #[test]
    fn requires_server_side_key() {
        assert!(matches!(
            ClientConfig::from_environment_key("client-side-key").to_client(),
            Err(Error::InvalidEnvironmentKey)
        ));
    }

    #[test]
    fn rejects_invalid_api_url() {
        assert!(matches!(
            ClientConfig::from_environment_key("ser.key")
                .api_url("not a url")
                .to_client(),
            Err(Error::InvalidBaseUrl(_))
        ));
    }

    #[test]
    fn offline_client_fails_on_missing_file() {
        assert!(matches!(
            ClientConfig::from_environment_key("key")
                .offline_environment("tests/data/missing.json")
                .to_client(),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn returns_no_local_environment_before_first_fetch() {
        let client = Client::with_fetcher(
            ClientConfig::from_environment_key("ser.key").refresh_interval(Duration::from_secs(3600)),
            Arc::new(|_timeout: Duration| -> Result<EnvironmentDocument> {
                Err(Error::UnexpectedStatus(500))
            }),
        )
        .unwrap();

        assert!(matches!(
            client.get_environment_flags(),
            Err(Error::NoLocalEnvironment)
        ));
        assert!(matches!(
            client.get_identity_flags("user", &Traits::new()),
            Err(Error::NoLocalEnvironment)
        ));
        assert!(matches!(
            client.get_identity_segments("user", &Traits::new()),
            Err(Error::NoLocalEnvironment)
        ));
        client.shutdown().unwrap();
    }

    #[test]
    fn evaluates_after_initial_fetch() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let client = {
            let fetches = fetches.clone();
            let file = FileEnvironmentFetcher::new(FIXTURE);
            Client::with_fetcher(
                ClientConfig::from_environment_key("ser.key")
                    .refresh_interval(Duration::from_secs(3600)),
                Arc::new(move |timeout: Duration| {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    crate::fetcher::EnvironmentFetcher::fetch(&file, timeout)
                }),
            )
            .unwrap()
        };

        let flags = client.get_environment_flags().unwrap();
        assert_eq!(flags.len(), 4);
        assert!(flags.is_feature_enabled("feature_1"));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        client.shutdown().unwrap();
    }

    #[test]
    fn environment_flags() {
        let flags = offline_client().get_environment_flags().unwrap();

        assert_eq!(flags.len(), 4);
        assert!(flags.is_feature_enabled("feature_1"));
        assert!(!flags.is_feature_enabled("disabled_feature"));
        assert!(!flags.is_feature_enabled("unknown_feature"));
        assert_eq!(
            flags.get_feature_value("feature_1"),
            Some(&Value::from("some_value"))
        );
        assert_eq!(
            flags.get_feature_value("integer_feature"),
            Some(&Value::from(42))
        );
        assert_eq!(flags.get_feature_value("unknown_feature"), None);
    }

    #[test]
    fn identity_flags() {
        let client = offline_client();

        let flags = client
            .get_identity_flags("alice", &traits([("foo", "bar")]))
            .unwrap();
        assert_eq!(
            flags.get_feature_value("feature_1"),
            Some(&Value::from("segment_value"))
        );

        let flags = client
            .get_identity_flags("overridden-user", &Traits::new())
            .unwrap();
        assert!(!flags.is_feature_enabled("feature_1"));
        assert_eq!(
            flags.get_feature_value("feature_1"),
            Some(&Value::from("identity_value"))
        );
    }

    #[test]
    fn identity_segments_exclude_overrides() {
        let client = offline_client();

        let segments = client
            .get_identity_segments("overridden-user", &traits([("plan", "premium")]))
            .unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].name, "premium_segment");

        assert!(client
            .get_identity_segments("alice", &Traits::new())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn hides_disabled_flags() {
        let mut document = crate::fetcher::EnvironmentFetcher::fetch(
            &FileEnvironmentFetcher::new(FIXTURE),
            Duration::from_secs(1),
        )
        .unwrap();
        document.project.hide_disabled_flags = true;

        let client = Client::offline(
            ClientConfig::from_environment_key("key"),
            Arc::new(move |_timeout: Duration| -> Result<EnvironmentDocument> {
                Ok(document.clone())
            }),
        )
        .unwrap();

        let flags = client.get_environment_flags().unwrap();
        assert_eq!(flags.len(), 3);
        assert!(flags.get_flag("disabled_feature").is_none());
        assert!(flags.iter().all(|flag| flag.enabled));

        let flags = client
            .get_identity_flags("overridden-user", &Traits::new())
            .unwrap();
        assert!(flags.get_flag("feature_1").is_none());
    }
}
