//! Environment document: the full configuration snapshot of one environment, as served by the
//! environment-document endpoint or stored in a local file.
//!
//! Parsing is lenient. A malformed segment, feature state, or identity override is dropped
//! (with a warning) instead of failing the whole document, so one bad entry cannot take down
//! evaluation of every other flag.
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};

use crate::{context::SegmentRule, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentDocument {
    #[serde(default)]
    pub id: i64,
    pub api_key: String,
    #[serde(default)]
    pub name: Option<String>,
    pub project: Project,
    #[serde(default, deserialize_with = "deserialize_lenient_vec")]
    pub feature_states: Vec<FeatureState>,
    #[serde(default, deserialize_with = "deserialize_lenient_vec")]
    pub identity_overrides: Vec<Identity>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub hide_disabled_flags: bool,
    #[serde(default, deserialize_with = "deserialize_lenient_vec")]
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub rules: Vec<SegmentRule>,
    #[serde(default, deserialize_with = "deserialize_lenient_vec")]
    pub feature_states: Vec<FeatureState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type", default)]
    pub feature_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureState {
    pub feature: Feature,
    pub enabled: bool,
    #[serde(default)]
    pub django_id: Option<i64>,
    #[serde(default)]
    pub featurestate_uuid: Option<String>,
    #[serde(default)]
    pub feature_state_value: Option<Value>,
    #[serde(default)]
    pub multivariate_feature_state_values: Vec<MultivariateFeatureStateValue>,
    #[serde(default)]
    pub feature_segment: Option<FeatureSegment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultivariateFeatureStateValue {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub mv_fs_value_uuid: Option<String>,
    pub percentage_allocation: f64,
    pub multivariate_feature_option: MultivariateFeatureOption,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultivariateFeatureOption {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSegment {
    #[serde(default)]
    pub priority: Option<i64>,
}

/// An identity, either one of the environment's identity overrides or one built by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub identifier: String,
    #[serde(default)]
    pub environment_api_key: String,
    #[serde(default)]
    pub identity_uuid: Option<String>,
    #[serde(default)]
    pub django_id: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_lenient_vec")]
    pub identity_features: Vec<FeatureState>,
    #[serde(default)]
    pub identity_traits: Vec<Trait>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trait {
    pub trait_key: String,
    #[serde(default)]
    pub trait_value: Option<Value>,
}

impl Trait {
    pub fn new(trait_key: impl Into<String>, trait_value: impl Into<Value>) -> Trait {
        Trait {
            trait_key: trait_key.into(),
            trait_value: Some(trait_value.into()),
        }
    }
}

impl Identity {
    /// Create a transient identity with no overrides.
    pub fn new(identifier: impl Into<String>, environment_api_key: impl Into<String>) -> Identity {
        Identity {
            identifier: identifier.into(),
            environment_api_key: environment_api_key.into(),
            identity_uuid: None,
            django_id: None,
            identity_features: Vec::new(),
            identity_traits: Vec::new(),
        }
    }

    /// Key identifying this identity for percentage hashing: the persisted id when there is one,
    /// otherwise the composite `<environment key>_<identifier>`.
    pub fn key(&self) -> String {
        if let Some(django_id) = self.django_id {
            return django_id.to_string();
        }
        if let Some(uuid) = &self.identity_uuid {
            return uuid.clone();
        }
        self.composite_key()
    }

    pub fn composite_key(&self) -> String {
        format!("{}_{}", self.environment_api_key, self.identifier)
    }
}

impl FeatureState {
    /// Key seeding multivariate selection for this feature state.
    pub fn key(&self) -> String {
        match (self.django_id, &self.featurestate_uuid) {
            (Some(id), _) => id.to_string(),
            (None, Some(uuid)) => uuid.clone(),
            (None, None) => self.feature.id.to_string(),
        }
    }

    pub fn priority(&self) -> Option<i64> {
        self.feature_segment.and_then(|segment| segment.priority)
    }

    /// Returns `true` if this state should win over `other` when both come from segments.
    /// Lower priority values win; a missing priority never wins.
    pub(crate) fn is_higher_segment_priority(&self, other: &FeatureState) -> bool {
        match (self.priority(), other.priority()) {
            (Some(own), Some(other)) => own < other,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

impl EnvironmentDocument {
    pub fn from_json(json: &[u8]) -> crate::Result<EnvironmentDocument> {
        serde_json::from_slice(json).map_err(|err| crate::Error::EnvironmentParse(err.into()))
    }

    pub fn hide_disabled_flags(&self) -> bool {
        self.project.hide_disabled_flags
    }
}

/// `TryParse` allows an entry to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TryParse<T> {
    Parsed(T),
    ParseFailed(serde_json::Value),
}

fn deserialize_lenient_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let entries = Option::<Vec<TryParse<T>>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(entries
        .into_iter()
        .filter_map(|entry| match entry {
            TryParse::Parsed(value) => Some(value),
            TryParse::ParseFailed(json) => {
                log::warn!(target: "flag_engine",
                           entry:serde = json;
                           "skipping malformed entry in environment document");
                None
            }
        })
        .collect())
}

/// Accepts RFC 3339 timestamps as well as naive ones (assumed UTC). Anything else is treated as
/// absent.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<serde_json::Value>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let parsed = raw.as_str().and_then(|s| {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            })
    });
    if parsed.is_none() {
        log::warn!(target: "flag_engine", updated_at:serde = raw; "ignoring unparseable updated_at");
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::BufReader};

    use chrono::{TimeZone, Utc};

    use super::{EnvironmentDocument, FeatureSegment, FeatureState, Identity};
    use crate::context::{ConditionOperator, RuleType};

    #[test]
    fn parse_environment_fixture() {
        let f = File::open("tests/data/environment.json")
            .expect("Failed to open tests/data/environment.json");
        let document: EnvironmentDocument = serde_json::from_reader(BufReader::new(f)).unwrap();

        assert_eq!(document.api_key, "B62qaMZNwfiqT76p38ggrQ");
        assert_eq!(document.feature_states.len(), 4);
        assert_eq!(document.project.segments.len(), 2);
        assert_eq!(document.identity_overrides.len(), 1);
        assert!(document.updated_at.is_some());

        let rule = &document.project.segments[0].rules[0];
        assert_eq!(rule.rule_type, RuleType::All);
        assert_eq!(rule.rules[0].conditions[0].operator, ConditionOperator::Equal);
        assert_eq!(rule.rules[0].conditions[0].property.as_deref(), Some("foo"));
    }

    #[test]
    fn parse_partially_if_unexpected() {
        let document = EnvironmentDocument::from_json(
            br#"{
                "api_key": "key",
                "project": {
                    "id": 1,
                    "name": "project",
                    "segments": [
                        {"id": 1, "name": "ok", "rules": [{"type": "ALL", "conditions": [], "rules": []}]},
                        {"name": "missing id"}
                    ]
                },
                "feature_states": [
                    {"feature": {"id": 1, "name": "a"}, "enabled": true},
                    {"feature": "not an object", "enabled": true}
                ],
                "updated_at": "yesterday"
            }"#,
        )
        .unwrap();

        assert_eq!(document.project.segments.len(), 1);
        assert_eq!(document.feature_states.len(), 1);
        assert_eq!(document.updated_at, None);
    }

    #[test]
    fn unknown_rule_types_and_operators_parse() {
        let document = EnvironmentDocument::from_json(
            br#"{
                "api_key": "key",
                "project": {"segments": [{
                    "id": 1,
                    "name": "future",
                    "rules": [{"type": "SOME", "conditions": [
                        {"operator": "SOUNDS_LIKE", "property_": "name", "value": "bob"}
                    ]}]
                }]}
            }"#,
        )
        .unwrap();

        let rule = &document.project.segments[0].rules[0];
        assert_eq!(rule.rule_type, RuleType::Unknown);
        assert_eq!(rule.conditions[0].operator, ConditionOperator::Unknown);
    }

    #[test]
    fn parses_naive_timestamps_as_utc() {
        let document = EnvironmentDocument::from_json(
            br#"{"api_key": "key", "project": {}, "updated_at": "2024-03-01T10:00:00.5"}"#,
        )
        .unwrap();
        assert_eq!(
            document.updated_at,
            Some(
                Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
                    + chrono::Duration::milliseconds(500)
            )
        );
    }

    #[test]
    fn rejects_non_json() {
        assert!(EnvironmentDocument::from_json(b"<html>").is_err());
    }

    #[test]
    fn identity_key_prefers_persisted_ids() {
        let mut identity = Identity::new("user", "env");
        assert_eq!(identity.key(), "env_user");
        identity.identity_uuid = Some("uuid".into());
        assert_eq!(identity.key(), "uuid");
        identity.django_id = Some(12);
        assert_eq!(identity.key(), "12");
    }

    #[test]
    fn segment_priority_ordering() {
        let state = |priority: Option<i64>| {
            let mut state: FeatureState = serde_json::from_str(
                r#"{"feature": {"id": 1, "name": "a"}, "enabled": true}"#,
            )
            .unwrap();
            state.feature_segment = Some(FeatureSegment { priority });
            state
        };

        assert!(state(Some(1)).is_higher_segment_priority(&state(Some(2))));
        assert!(!state(Some(2)).is_higher_segment_priority(&state(Some(1))));
        assert!(!state(Some(1)).is_higher_segment_priority(&state(Some(1))));
        assert!(state(Some(5)).is_higher_segment_priority(&state(None)));
        assert!(!state(None).is_higher_segment_priority(&state(Some(5))));
    }
}
