use std::collections::HashMap;

use crate::{
    context::{
        EvaluationContext, EvaluationResult, FeatureContext, FeatureVariant, FlagResult,
        SegmentContext, SegmentResult, SegmentSource,
    },
    environment::{EnvironmentDocument, FeatureState, Identity, Segment, Trait},
    hashing::{Md5PercentageHasher, PercentageHasher},
    mapper, Value,
};

/// Flag result reason for flags resolved from environment defaults.
pub const REASON_DEFAULT: &str = "DEFAULT";
/// Flag result reason for flags resolved from an identity override.
pub const REASON_IDENTITY_OVERRIDE: &str = "IDENTITY_OVERRIDE";

/// How a percentage split compares the identity's hash against the condition threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitComparison {
    /// Match when `hash <= threshold`.
    #[default]
    HashAtOrBelowThreshold,
    /// Match when `hash > threshold`.
    HashAboveThreshold,
}

impl SplitComparison {
    pub fn matches(self, hash: f64, threshold: f64) -> bool {
        match self {
            SplitComparison::HashAtOrBelowThreshold => hash <= threshold,
            SplitComparison::HashAboveThreshold => hash > threshold,
        }
    }
}

/// Configuration for [`Engine`].
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    /// Comparison used by `PERCENTAGE_SPLIT` conditions.
    ///
    /// Defaults to [`SplitComparison::HashAtOrBelowThreshold`].
    pub split_comparison: SplitComparison,
    /// Whether an `ALL` rule without conditions matches.
    ///
    /// Defaults to `true`.
    pub empty_all_rule_matches: bool,
}

impl EngineOptions {
    pub fn with_split_comparison(mut self, split_comparison: SplitComparison) -> EngineOptions {
        self.split_comparison = split_comparison;
        self
    }

    pub fn with_empty_all_rule_matches(mut self, matches: bool) -> EngineOptions {
        self.empty_all_rule_matches = matches;
        self
    }
}

impl Default for EngineOptions {
    fn default() -> EngineOptions {
        EngineOptions {
            split_comparison: SplitComparison::default(),
            empty_all_rule_matches: true,
        }
    }
}

/// The rule evaluation engine.
///
/// Evaluation functions are pure: they perform no I/O, never block, and never fail. Bad
/// configuration resolves to "condition does not match".
///
/// ```
/// # use flag_engine::Engine;
/// let engine = Engine::new();
/// ```
#[derive(Debug, Clone, Default)]
pub struct Engine<H = Md5PercentageHasher> {
    hasher: H,
    options: EngineOptions,
}

impl Engine {
    pub fn new() -> Engine {
        Engine::default()
    }
}

impl<H: PercentageHasher> Engine<H> {
    /// Create an engine with a custom percentage hasher.
    pub fn with_hasher(hasher: H) -> Engine<H> {
        Engine {
            hasher,
            options: EngineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Engine<H> {
        self.options = options;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub(crate) fn hasher(&self) -> &H {
        &self.hasher
    }

    /// Evaluate every feature of the context.
    ///
    /// Segments are visited in key order. For each feature, the override with the lowest
    /// priority among matched segments replaces the environment default; on equal priority the
    /// first matched segment wins.
    pub fn evaluate(&self, ctx: &EvaluationContext) -> EvaluationResult {
        let mut segments = Vec::new();
        let mut overrides: HashMap<&str, (&FeatureContext, &SegmentContext)> = HashMap::new();

        for segment in ctx.segments.values() {
            if !self.matches_segment(ctx, segment) {
                continue;
            }

            segments.push(SegmentResult {
                key: segment.key.clone(),
                name: segment.name.clone(),
                metadata: segment.metadata.clone(),
            });

            for feature in &segment.overrides {
                let replace = match overrides.get(feature.name.as_str()) {
                    Some((current, _)) => has_higher_priority(feature.priority, current.priority),
                    None => true,
                };
                if replace {
                    overrides.insert(feature.name.as_str(), (feature, segment));
                }
            }
        }

        let identity_key = ctx.identity_key();
        let flags = ctx
            .features
            .values()
            .map(|feature| {
                let flag = match overrides.get(feature.name.as_str()) {
                    Some((override_feature, segment)) => {
                        let mut flag = self.flag_result(override_feature, identity_key);
                        flag.reason = Some(targeting_reason(segment));
                        flag.metadata = override_feature.metadata.or(feature.metadata);
                        flag
                    }
                    None => self.flag_result(feature, identity_key),
                };
                (feature.name.clone(), flag)
            })
            .collect();

        log::trace!(target: "flag_engine",
                    environment:display = ctx.environment.key,
                    identity = identity_key,
                    segments = segments.len();
                    "evaluated context");

        EvaluationResult { flags, segments }
    }

    fn flag_result(&self, feature: &FeatureContext, identity_key: Option<&str>) -> FlagResult {
        let (value, reason) = match self.select_variant(feature, identity_key) {
            Some(variant) => (
                variant.value.clone(),
                format!("SPLIT; weight={}", variant.weight),
            ),
            None => (feature.value.clone(), REASON_DEFAULT.to_owned()),
        };

        FlagResult {
            enabled: feature.enabled,
            feature_key: feature.key.clone(),
            name: feature.name.clone(),
            value,
            reason: Some(reason),
            metadata: feature.metadata,
        }
    }

    /// Pick a weighted variant for the identity. Variants are walked by priority, then
    /// declaration order; `None` means the control value applies.
    fn select_variant<'a>(
        &self,
        feature: &'a FeatureContext,
        identity_key: Option<&str>,
    ) -> Option<&'a FeatureVariant> {
        let identity_key = identity_key?;
        if feature.variants.is_empty() {
            return None;
        }

        let mut variants = feature.variants.iter().collect::<Vec<_>>();
        variants.sort_by_key(|variant| variant.priority.unwrap_or(i64::MAX));

        let percentage = self
            .hasher
            .hashed_percentage(&[feature.key.as_str(), identity_key]);
        pick_weighted(variants, percentage, |variant| variant.weight)
    }

    /// Resolve the feature states of `identity` from an environment document.
    ///
    /// Precedence: environment default, then overrides of matched segments (document order, the
    /// lower priority wins, a later segment wins a tie), then the identity's own overrides. Only
    /// features present in the environment are returned. Disabled features are dropped when the
    /// project hides disabled flags.
    ///
    /// `override_traits` replace the identity's stored traits when not empty.
    pub fn resolve_feature_states<'a>(
        &self,
        document: &'a EnvironmentDocument,
        identity: &'a Identity,
        override_traits: &[Trait],
    ) -> Vec<&'a FeatureState> {
        let mut states = document.feature_states.iter().collect::<Vec<_>>();
        let positions = states
            .iter()
            .enumerate()
            .map(|(i, state)| (state.feature.id, i))
            .collect::<HashMap<_, _>>();

        for segment in self.identity_segments(document, identity, override_traits) {
            for state in &segment.feature_states {
                let Some(&i) = positions.get(&state.feature.id) else {
                    continue;
                };
                if states[i].is_higher_segment_priority(state) {
                    continue;
                }
                states[i] = state;
            }
        }

        for state in &identity.identity_features {
            if let Some(&i) = positions.get(&state.feature.id) {
                states[i] = state;
            }
        }

        if document.hide_disabled_flags() {
            states.retain(|state| state.enabled);
        }
        states
    }

    /// Document segments that `identity` belongs to, in document order.
    pub fn identity_segments<'a>(
        &self,
        document: &'a EnvironmentDocument,
        identity: &Identity,
        override_traits: &[Trait],
    ) -> Vec<&'a Segment> {
        let ctx = mapper::segment_matching_context(identity, override_traits);
        document
            .project
            .segments
            .iter()
            .filter(|segment| self.matches_segment(&ctx, &SegmentContext::from(*segment)))
            .collect()
    }

    /// Returns `true` if `identity` (with `traits` replacing its stored ones when not empty)
    /// belongs to `segment`.
    pub fn is_in_segment(&self, identity: &Identity, segment: &Segment, traits: &[Trait]) -> bool {
        let ctx = mapper::segment_matching_context(identity, traits);
        self.matches_segment(&ctx, &SegmentContext::from(segment))
    }

    /// Value of a feature state for an identity, selecting a multivariate option when the state
    /// has any.
    pub fn feature_state_value(&self, state: &FeatureState, identity_key: &str) -> Option<Value> {
        if state.multivariate_feature_state_values.is_empty() {
            return state.feature_state_value.clone();
        }

        let state_key = state.key();
        let percentage = self
            .hasher
            .hashed_percentage(&[state_key.as_str(), identity_key]);
        match pick_weighted(
            state.multivariate_feature_state_values.iter(),
            percentage,
            |value| value.percentage_allocation,
        ) {
            Some(value) => value.multivariate_feature_option.value.clone(),
            None => state.feature_state_value.clone(),
        }
    }
}

/// Walk cumulative weights and return the item whose range contains `percentage`.
fn pick_weighted<T>(
    items: impl IntoIterator<Item = T>,
    percentage: f64,
    weight: impl Fn(&T) -> f64,
) -> Option<T> {
    let mut start = 0.0;
    for item in items {
        let limit = start + weight(&item);
        if start <= percentage && percentage < limit {
            return Some(item);
        }
        start = limit;
    }
    None
}

/// Absent priority loses to any explicit one; ties keep the existing override.
fn has_higher_priority(candidate: Option<i64>, current: Option<i64>) -> bool {
    match (candidate, current) {
        (Some(candidate), Some(current)) => candidate < current,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

fn targeting_reason(segment: &SegmentContext) -> String {
    match segment.metadata.as_ref().map(|metadata| metadata.source) {
        Some(SegmentSource::IdentityOverrides) => REASON_IDENTITY_OVERRIDE.to_owned(),
        _ => format!("TARGETING_MATCH; segment={}", segment.name),
    }
}
