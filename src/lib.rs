//! Local feature flag evaluation.
//!
//! # Overview
//!
//! The crate evaluates feature flags against an *environment document*: a full snapshot of the
//! features, segments, and identity overrides of one environment. Evaluation is local, pure, and
//! never blocks.
//!
//! The [`Engine`] evaluates an [`EvaluationContext`] (environment, optional identity with
//! [`Traits`], features, and segments) into an [`EvaluationResult`]. Segment rules are trees of
//! conditions combined with `ALL`/`ANY`/`NONE`; percentage splits and multivariate features are
//! decided by a deterministic md5-based hash of stable identifiers (see
//! [`hashed_percentage_for_object_ids`]).
//!
//! The [`Client`] keeps an up-to-date copy of the environment document in an
//! [`EnvironmentStore`]: it refreshes on a fixed interval from a [`PollerThread`] and, optionally,
//! as soon as the server announces a change on its realtime event stream
//! ([`RealtimeListener`]).
//!
//! ```
//! # use flag_engine::{Engine, EnvironmentDocument, Traits, mapper};
//! let document = EnvironmentDocument::from_json(br#"{
//!     "api_key": "environment-key",
//!     "project": {"segments": []},
//!     "feature_states": [{
//!         "feature": {"id": 1, "name": "feature_1"},
//!         "enabled": true,
//!         "feature_state_value": "some_value"
//!     }]
//! }"#).unwrap();
//!
//! let ctx = mapper::identity_context(
//!     &mapper::environment_context(&document),
//!     "user-1",
//!     &Traits::new(),
//!     None,
//! );
//! let result = Engine::new().evaluate(&ctx);
//! assert!(result.flags["feature_1"].enabled);
//! ```
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Evaluation does not return errors: malformed rules, literals, regular expressions, or versions
//! resolve to "condition does not match". Fetch and stream failures are retried in the
//! background and reported to an [`ErrorHandler`]. Evaluating before any environment was fetched
//! returns [`Error::NoLocalEnvironment`] so the caller can fall back to defaults.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages
//! (target `flag_engine`). Consider integrating a `log`-compatible logger implementation for better
//! visibility into refreshes and realtime updates.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod backoff;
pub mod cancel;
mod client;
mod config;
pub mod context;
pub mod environment;
mod environment_store;
mod error;
mod error_handler;
pub mod eval;
pub mod fetcher;
pub mod hashing;
pub mod mapper;
pub mod poller;
pub mod realtime;
mod rules;
mod value;

pub use client::{Client, Flags};
pub use config::ClientConfig;
pub use context::{
    Condition, ConditionOperator, ConditionValue, EvaluationContext, EvaluationResult,
    FlagResult, SegmentResult, Traits,
};
pub use environment::{EnvironmentDocument, FeatureState, Identity, Segment, Trait};
pub use environment_store::{EnvironmentSnapshot, EnvironmentStore};
pub use error::{Error, Result};
pub use error_handler::ErrorHandler;
pub use eval::{Engine, EngineOptions, SplitComparison};
pub use fetcher::EnvironmentFetcher;
pub use hashing::{hashed_percentage_for_object_ids, PercentageHasher};
pub use poller::{PollerConfig, PollerThread};
pub use realtime::RealtimeListener;
pub use value::Value;
