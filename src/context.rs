//! Evaluation context and evaluation result types.
//!
//! An [`EvaluationContext`] is a self-contained, immutable description of everything needed to
//! evaluate flags: environment, optional identity with traits, features with their default
//! states, and segments with their overrides. [`EvaluationResult`] is what the engine produces
//! from it.
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer, Serialize};

use crate::Value;

/// Prefix of property names that are resolved against the context instead of identity traits.
pub const CONTEXT_PATH_PREFIX: &str = "$.";

/// Caller-supplied identity attributes.
pub type Traits = HashMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
    pub environment: EnvironmentContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityContext>,
    /// Features keyed by name.
    #[serde(default)]
    pub features: HashMap<String, FeatureContext>,
    /// Segments keyed by segment key. Segments are visited in key order.
    #[serde(default)]
    pub segments: BTreeMap<String, SegmentContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentContext {
    pub key: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityContext {
    pub identifier: String,
    /// Stable key used for percentage hashing.
    pub key: String,
    #[serde(default, deserialize_with = "deserialize_traits")]
    pub traits: Traits,
}

/// Null trait values are treated as absent.
fn deserialize_traits<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Traits, D::Error> {
    let traits = HashMap::<String, Option<Value>>::deserialize(deserializer)?;
    Ok(traits
        .into_iter()
        .filter_map(|(key, value)| value.map(|value| (key, value)))
        .collect())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureContext {
    /// Stable key used to seed multivariate selection.
    pub key: String,
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<FeatureVariant>,
    /// Override priority when used as a segment override. Lower wins; absent loses to any
    /// explicit priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FeatureMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVariant {
    #[serde(default)]
    pub value: Option<Value>,
    /// Percentage weight in `[0, 100]`.
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureMetadata {
    pub feature_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentContext {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub rules: Vec<SegmentRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<FeatureContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SegmentMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<i64>,
    #[serde(default)]
    pub source: SegmentSource,
}

/// Where a segment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentSource {
    /// A segment defined in the project.
    #[default]
    Api,
    /// A synthetic segment carrying a single identity's overrides.
    IdentityOverrides,
}

/// A node of a segment's rule tree.
///
/// A rule matches iff its conditions satisfy its quantifier and every nested rule matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRule {
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub rules: Vec<SegmentRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    All,
    Any,
    None,
    /// Rule types this version does not know about. Never match.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub operator: ConditionOperator,
    /// Trait key, or a `$.`-prefixed context path.
    #[serde(default, alias = "property_")]
    pub property: Option<String>,
    #[serde(default)]
    pub value: Option<ConditionValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionOperator {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanInclusive,
    LessThan,
    LessThanInclusive,
    Contains,
    NotContains,
    In,
    Regex,
    PercentageSplit,
    Modulo,
    IsSet,
    IsNotSet,
    /// Operators this version does not know about. Never match.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Multiple(Vec<Value>),
    Single(Value),
}

impl<T: Into<Value>> From<T> for ConditionValue {
    fn from(value: T) -> Self {
        Self::Single(value.into())
    }
}

impl<T: Into<Value>> From<Vec<T>> for ConditionValue {
    fn from(value: Vec<T>) -> Self {
        Self::Multiple(value.into_iter().map(Into::into).collect())
    }
}

impl Condition {
    pub fn new(
        operator: ConditionOperator,
        property: impl Into<String>,
        value: impl Into<ConditionValue>,
    ) -> Condition {
        Condition {
            operator,
            property: Some(property.into()),
            value: Some(value.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// Resolved flags keyed by feature name.
    pub flags: HashMap<String, FlagResult>,
    /// Segments the context matched, in evaluation order.
    pub segments: Vec<SegmentResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagResult {
    pub enabled: bool,
    pub feature_key: String,
    pub name: String,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FeatureMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentResult {
    pub key: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SegmentMetadata>,
}

impl EvaluationContext {
    /// Resolve a condition property against this context.
    ///
    /// `$.`-prefixed properties are context paths such as `$.identity.identifier` or
    /// `$.identity.traits['my trait']`; anything else is an identity trait key. Returns `None`
    /// whenever the value cannot be resolved.
    pub fn resolve_property(&self, property: &str) -> Option<Value> {
        match property.strip_prefix(CONTEXT_PATH_PREFIX) {
            Some(path) => self.resolve_path(&parse_path(path)?),
            None => self.identity.as_ref()?.traits.get(property).cloned(),
        }
    }

    fn resolve_path(&self, path: &[String]) -> Option<Value> {
        let segments = path.iter().map(String::as_str).collect::<Vec<_>>();
        match segments.as_slice() {
            ["environment", "key"] => Some(self.environment.key.clone().into()),
            ["environment", "name"] => Some(self.environment.name.clone().into()),
            ["identity", "identifier"] => Some(self.identity.as_ref()?.identifier.clone().into()),
            ["identity", "key"] => Some(self.identity.as_ref()?.key.clone().into()),
            ["identity", "traits", name] => self.identity.as_ref()?.traits.get(*name).cloned(),
            ["features", name, field] => {
                let feature = self.features.get(*name)?;
                match *field {
                    "key" => Some(feature.key.clone().into()),
                    "name" => Some(feature.name.clone().into()),
                    "enabled" => Some(feature.enabled.into()),
                    "value" => feature.value.clone(),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Identity key used for percentage hashing, if the context has an identity.
    pub fn identity_key(&self) -> Option<&str> {
        self.identity.as_ref().map(|identity| identity.key.as_str())
    }
}

/// Split a path such as `identity.traits['a.b']` into `["identity", "traits", "a.b"]`.
///
/// Returns `None` for malformed paths (empty segments, unterminated brackets).
fn parse_path(path: &str) -> Option<Vec<String>> {
    let mut segments = Vec::new();
    let mut rest = path;

    while !rest.is_empty() {
        if let Some(bracketed) = rest.strip_prefix('[') {
            let quote = bracketed.chars().next().filter(|c| *c == '\'' || *c == '"')?;
            let inner = &bracketed[1..];
            let end = inner.find(quote)?;
            segments.push(inner[..end].to_owned());
            rest = inner[end + 1..].strip_prefix(']')?;
        } else {
            let end = rest.find(['.', '[']).unwrap_or(rest.len());
            if end == 0 {
                return None;
            }
            segments.push(rest[..end].to_owned());
            rest = &rest[end..];
        }

        if let Some(next) = rest.strip_prefix('.') {
            if next.is_empty() || next.starts_with('.') {
                return None;
            }
            rest = next;
        }
    }

    if segments.is_empty() {
        None
    } else {
        Some(segments)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use super::{parse_path, EnvironmentContext, EvaluationContext, IdentityContext};
    use crate::Value;

    fn context() -> EvaluationContext {
        EvaluationContext {
            environment: EnvironmentContext {
                key: "env-key".into(),
                name: "Production".into(),
            },
            identity: Some(IdentityContext {
                identifier: "user@example.com".into(),
                key: "env-key_user@example.com".into(),
                traits: HashMap::from([
                    ("plan".into(), "premium".into()),
                    ("a.b".into(), 5.into()),
                ]),
            }),
            features: HashMap::new(),
            segments: BTreeMap::new(),
        }
    }

    #[test]
    fn parses_dotted_and_bracketed_paths() {
        assert_eq!(
            parse_path("identity.traits['a.b']").unwrap(),
            vec!["identity", "traits", "a.b"]
        );
        assert_eq!(
            parse_path("identity.traits[\"x y\"]").unwrap(),
            vec!["identity", "traits", "x y"]
        );
        assert_eq!(parse_path("identity.key").unwrap(), vec!["identity", "key"]);
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(parse_path("").is_none());
        assert!(parse_path("identity..key").is_none());
        assert!(parse_path("identity.").is_none());
        assert!(parse_path("identity.traits['open").is_none());
        assert!(parse_path("identity.traits[plan]").is_none());
    }

    #[test]
    fn resolves_context_paths() {
        let ctx = context();
        assert_eq!(
            ctx.resolve_property("$.identity.identifier"),
            Some(Value::from("user@example.com"))
        );
        assert_eq!(
            ctx.resolve_property("$.environment.name"),
            Some(Value::from("Production"))
        );
        assert_eq!(
            ctx.resolve_property("$.identity.traits['a.b']"),
            Some(Value::from(5))
        );
        assert_eq!(ctx.resolve_property("$.identity.unknown"), None);
        assert_eq!(ctx.resolve_property("$.identity..key"), None);
    }

    #[test]
    fn resolves_traits_by_exact_key() {
        let ctx = context();
        assert_eq!(ctx.resolve_property("plan"), Some(Value::from("premium")));
        assert_eq!(ctx.resolve_property("a.b"), Some(Value::from(5)));
        assert_eq!(ctx.resolve_property("missing"), None);
    }

    #[test]
    fn resolves_nothing_without_identity() {
        let ctx = EvaluationContext {
            identity: None,
            ..context()
        };
        assert_eq!(ctx.resolve_property("plan"), None);
        assert_eq!(ctx.resolve_property("$.identity.identifier"), None);
        assert_eq!(
            ctx.resolve_property("$.environment.key"),
            Some(Value::from("env-key"))
        );
    }

    #[test]
    fn null_traits_are_absent() {
        let identity: IdentityContext = serde_json::from_str(
            r#"{"identifier": "a", "key": "k", "traits": {"x": null, "y": 1}}"#,
        )
        .unwrap();
        assert_eq!(identity.traits.len(), 1);
        assert_eq!(identity.traits.get("y"), Some(&Value::from(1)));
    }
}
