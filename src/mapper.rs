//! Conversion of [`EnvironmentDocument`] parts into [`EvaluationContext`] parts.
use std::collections::{BTreeMap, HashMap};

use crate::{
    context::{
        Condition, ConditionOperator, ConditionValue, EnvironmentContext, EvaluationContext, FeatureContext,
        FeatureMetadata, FeatureVariant, IdentityContext, RuleType, SegmentContext,
        SegmentMetadata, SegmentRule, SegmentSource, Traits,
    },
    environment::{EnvironmentDocument, FeatureState, Identity, Segment, Trait},
    Value,
};

/// Segment name used for the synthetic segment carrying an identity's overrides.
pub const IDENTITY_OVERRIDES_SEGMENT_NAME: &str = "identity_overrides";

/// Priority given to identity overrides so they beat any segment override.
const IDENTITY_OVERRIDE_PRIORITY: i64 = i64::MIN;

impl From<&FeatureState> for FeatureContext {
    fn from(state: &FeatureState) -> FeatureContext {
        FeatureContext {
            key: state.key(),
            name: state.feature.name.clone(),
            enabled: state.enabled,
            value: state.feature_state_value.clone(),
            variants: state
                .multivariate_feature_state_values
                .iter()
                .map(|variant| FeatureVariant {
                    value: variant.multivariate_feature_option.value.clone(),
                    weight: variant.percentage_allocation,
                    priority: None,
                })
                .collect(),
            priority: state.priority(),
            metadata: Some(FeatureMetadata {
                feature_id: state.feature.id,
            }),
        }
    }
}

impl From<&Segment> for SegmentContext {
    fn from(segment: &Segment) -> SegmentContext {
        SegmentContext {
            key: segment.id.to_string(),
            name: segment.name.clone(),
            rules: segment.rules.clone(),
            overrides: segment
                .feature_states
                .iter()
                .map(FeatureContext::from)
                .collect(),
            metadata: Some(SegmentMetadata {
                segment_id: Some(segment.id),
                source: SegmentSource::Api,
            }),
        }
    }
}

/// Build the identity-less context of an environment: its features and project segments.
pub fn environment_context(document: &EnvironmentDocument) -> EvaluationContext {
    EvaluationContext {
        environment: EnvironmentContext {
            key: document.api_key.clone(),
            name: document.name.clone().unwrap_or_default(),
        },
        identity: None,
        features: document
            .feature_states
            .iter()
            .map(|state| (state.feature.name.clone(), FeatureContext::from(state)))
            .collect(),
        segments: document
            .project
            .segments
            .iter()
            .map(|segment| (segment.id.to_string(), SegmentContext::from(segment)))
            .collect(),
    }
}

/// Extend an environment context with an identity.
///
/// When the environment stores an override record for the identity, its feature states are
/// added as a synthetic segment that matches exactly this identifier and wins over every other
/// segment.
pub fn identity_context(
    environment: &EvaluationContext,
    identifier: &str,
    traits: &Traits,
    identity_override: Option<&Identity>,
) -> EvaluationContext {
    let key = match identity_override {
        Some(identity) => identity.key(),
        None => format!("{}_{}", environment.environment.key, identifier),
    };

    let mut ctx = environment.clone();
    ctx.identity = Some(IdentityContext {
        identifier: identifier.to_owned(),
        key,
        traits: traits.clone(),
    });

    if let Some(identity) = identity_override.filter(|i| !i.identity_features.is_empty()) {
        let segment = identity_override_segment(identity);
        ctx.segments.insert(segment.key.clone(), segment);
    }

    ctx
}

fn identity_override_segment(identity: &Identity) -> SegmentContext {
    SegmentContext {
        key: format!("{}:{}", IDENTITY_OVERRIDES_SEGMENT_NAME, identity.identifier),
        name: IDENTITY_OVERRIDES_SEGMENT_NAME.to_owned(),
        rules: vec![SegmentRule {
            rule_type: RuleType::All,
            // Membership compares plain strings, whatever the identifier looks like.
            conditions: vec![Condition::new(
                ConditionOperator::In,
                "$.identity.identifier",
                ConditionValue::Multiple(vec![Value::from(identity.identifier.as_str())]),
            )],
            rules: vec![],
        }],
        overrides: identity
            .identity_features
            .iter()
            .map(|state| FeatureContext {
                priority: Some(IDENTITY_OVERRIDE_PRIORITY),
                ..FeatureContext::from(state)
            })
            .collect(),
        metadata: Some(SegmentMetadata {
            segment_id: None,
            source: SegmentSource::IdentityOverrides,
        }),
    }
}

/// Context used to match an identity against document segments: environment key taken from the
/// identity, no features or segments of its own. `override_traits` replace the identity's
/// stored traits when not empty.
pub(crate) fn segment_matching_context(
    identity: &Identity,
    override_traits: &[Trait],
) -> EvaluationContext {
    let traits = if override_traits.is_empty() {
        identity.identity_traits.as_slice()
    } else {
        override_traits
    };

    EvaluationContext {
        environment: EnvironmentContext {
            key: identity.environment_api_key.clone(),
            name: String::new(),
        },
        identity: Some(IdentityContext {
            identifier: identity.identifier.clone(),
            key: identity.key(),
            traits: traits_to_map(traits),
        }),
        features: HashMap::new(),
        segments: BTreeMap::new(),
    }
}

pub fn traits_to_map(traits: &[Trait]) -> Traits {
    traits
        .iter()
        .filter_map(|t| Some((t.trait_key.clone(), t.trait_value.clone()?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::BufReader};

    use super::{environment_context, identity_context, IDENTITY_OVERRIDES_SEGMENT_NAME};
    use crate::{
        context::{SegmentSource, Traits},
        environment::{EnvironmentDocument, Trait},
        mapper::traits_to_map,
        Engine, Value,
    };

    fn document() -> EnvironmentDocument {
        let f = File::open("tests/data/environment.json").unwrap();
        serde_json::from_reader(BufReader::new(f)).unwrap()
    }

    #[test]
    fn maps_features_and_segments() {
        let document = document();
        let ctx = environment_context(&document);

        assert_eq!(ctx.environment.key, document.api_key);
        assert_eq!(ctx.features.len(), document.feature_states.len());
        assert_eq!(ctx.segments.len(), document.project.segments.len());
        assert!(ctx.identity.is_none());

        let feature = &ctx.features["feature_1"];
        assert_eq!(feature.value, Some(Value::from("some_value")));
        assert_eq!(feature.metadata.map(|m| m.feature_id), Some(1));

        let mv_feature = &ctx.features["mv_feature"];
        assert_eq!(mv_feature.variants.len(), 2);
        assert_eq!(mv_feature.key, "3");
    }

    #[test]
    fn transient_identity_gets_composite_key() {
        let document = document();
        let ctx = identity_context(&environment_context(&document), "someone", &Traits::new(), None);
        let identity = ctx.identity.unwrap();
        assert_eq!(identity.key, format!("{}_someone", document.api_key));
        assert_eq!(ctx.segments.len(), document.project.segments.len());
    }

    #[test]
    fn identity_override_becomes_segment() {
        let document = document();
        let identity = &document.identity_overrides[0];
        let ctx = identity_context(
            &environment_context(&document),
            &identity.identifier,
            &Traits::new(),
            Some(identity),
        );

        assert_eq!(ctx.identity.unwrap().key, identity.key());
        let segment = ctx
            .segments
            .values()
            .find(|s| s.name == IDENTITY_OVERRIDES_SEGMENT_NAME)
            .unwrap();
        assert_eq!(
            segment.metadata.as_ref().unwrap().source,
            SegmentSource::IdentityOverrides
        );
        assert!(segment.overrides.iter().all(|o| o.priority == Some(i64::MIN)));
    }

    #[test]
    fn identity_override_applies_to_any_identifier() {
        let document = document();
        let environment = environment_context(&document);

        for identifier in ["NaN", "nan", "inf", "true", "007", "beta:semver", "1.0:semver"] {
            let mut identity = document.identity_overrides[0].clone();
            identity.identifier = identifier.to_owned();
            let ctx = identity_context(&environment, identifier, &Traits::new(), Some(&identity));

            let flag = &Engine::new().evaluate(&ctx).flags["feature_1"];
            assert!(!flag.enabled, "{identifier}");
            assert_eq!(
                flag.value,
                Some(Value::from("identity_value")),
                "{identifier}"
            );
        }
    }

    #[test]
    fn null_traits_are_dropped() {
        let traits = traits_to_map(&[
            Trait::new("a", 1),
            Trait {
                trait_key: "b".into(),
                trait_value: None,
            },
        ]);
        assert_eq!(traits.len(), 1);
    }
}
