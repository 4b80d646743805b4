use std::cmp::Ordering;

use regex::Regex;
use semver::Version;

use crate::{
    context::{
        Condition, ConditionOperator, ConditionValue, EvaluationContext, RuleType,
        SegmentContext, SegmentRule,
    },
    hashing::PercentageHasher,
    Engine, Value,
};

/// Suffix marking a condition literal as a semantic version.
const SEMVER_SUFFIX: &str = ":semver";

impl<H: PercentageHasher> Engine<H> {
    /// Returns `true` if the context is in `segment`. A segment without rules never matches;
    /// otherwise every top-level rule must match.
    pub fn matches_segment(&self, ctx: &EvaluationContext, segment: &SegmentContext) -> bool {
        !segment.rules.is_empty()
            && segment
                .rules
                .iter()
                .all(|rule| self.matches_rule(ctx, rule, &segment.key))
    }

    /// Returns `true` if the rule's conditions satisfy its quantifier and every nested rule
    /// matches as well.
    pub fn matches_rule(&self, ctx: &EvaluationContext, rule: &SegmentRule, segment_key: &str) -> bool {
        let mut conditions = rule
            .conditions
            .iter()
            .map(|condition| self.matches_condition(ctx, condition, segment_key));

        let conditions_match = match rule.rule_type {
            RuleType::All if rule.conditions.is_empty() => self.options().empty_all_rule_matches,
            RuleType::All => conditions.all(|matches| matches),
            RuleType::Any => conditions.any(|matches| matches),
            RuleType::None => !conditions.any(|matches| matches),
            RuleType::Unknown => false,
        };

        conditions_match
            && rule
                .rules
                .iter()
                .all(|nested| self.matches_rule(ctx, nested, segment_key))
    }

    /// Returns `true` if the condition holds for the context. Misconfigured conditions never
    /// match.
    pub fn matches_condition(
        &self,
        ctx: &EvaluationContext,
        condition: &Condition,
        segment_key: &str,
    ) -> bool {
        let value = condition
            .property
            .as_deref()
            .and_then(|property| ctx.resolve_property(property));

        match condition.operator {
            ConditionOperator::IsSet => value.is_some(),
            ConditionOperator::IsNotSet => value.is_none(),
            ConditionOperator::PercentageSplit => self
                .try_percentage_split(ctx, condition, value.as_ref(), segment_key)
                .unwrap_or(false),
            operator => value.map_or(false, |value| {
                operator.eval(&value, condition.value.as_ref())
            }),
        }
    }

    fn try_percentage_split(
        &self,
        ctx: &EvaluationContext,
        condition: &Condition,
        value: Option<&Value>,
        segment_key: &str,
    ) -> Option<bool> {
        let object_id = match value {
            Some(value) => value.to_string(),
            None => ctx.identity_key()?.to_owned(),
        };
        let threshold = match condition.value.as_ref()? {
            ConditionValue::Single(Value::Integer(i)) => *i as f64,
            ConditionValue::Single(Value::Float(f)) => *f,
            ConditionValue::Single(Value::String(s)) => s.trim().parse().ok()?,
            _ => return None,
        };

        let hash = self
            .hasher()
            .hashed_percentage(&[segment_key, object_id.as_str()]);
        Some(self.options().split_comparison.matches(hash, threshold))
    }
}

impl ConditionOperator {
    /// Applying the operator to a resolved (non-absent) context value. Returns `false` if the
    /// operator cannot be applied or there's a misconfiguration.
    pub fn eval(&self, value: &Value, condition_value: Option<&ConditionValue>) -> bool {
        self.try_eval(value, condition_value).unwrap_or(false)
    }

    /// Try applying the operator, returning `None` if it cannot be applied.
    fn try_eval(&self, value: &Value, condition_value: Option<&ConditionValue>) -> Option<bool> {
        let condition_value = condition_value?;
        match self {
            Self::In => {
                let candidate = value.to_string();
                Some(in_list(condition_value).iter().any(|item| *item == candidate))
            }

            Self::Regex => {
                let regex = Regex::new(&single_literal(condition_value)?).ok()?;
                Some(regex.is_match(&value.to_string()))
            }

            Self::Modulo => {
                let (divisor, remainder) = single_literal(condition_value)?
                    .split_once('|')
                    .and_then(|(divisor, remainder)| {
                        Some((divisor.parse::<f64>().ok()?, remainder.parse::<f64>().ok()?))
                    })?;
                Some(value.as_f64()? % divisor == remainder)
            }

            Self::Contains | Self::NotContains => {
                let contains = value
                    .to_string()
                    .contains(&single_literal(condition_value)?);
                Some(contains == (*self == Self::Contains))
            }

            Self::Equal
            | Self::NotEqual
            | Self::GreaterThan
            | Self::GreaterThanInclusive
            | Self::LessThan
            | Self::LessThanInclusive => {
                self.compare(&value.to_string(), &single_literal(condition_value)?)
            }

            Self::IsSet | Self::IsNotSet | Self::PercentageSplit | Self::Unknown => None,
        }
    }

    /// Compare with coercion: booleans, then integers, then floats, then semantic versions
    /// (literal suffixed with `:semver`), then plain strings.
    fn compare(&self, value: &str, literal: &str) -> Option<bool> {
        if let (Some(value), Some(literal)) = (parse_bool(value), parse_bool(literal)) {
            return match self {
                Self::Equal => Some(value == literal),
                Self::NotEqual => Some(value != literal),
                _ => None,
            };
        }

        if let (Ok(value), Ok(literal)) = (value.parse::<i64>(), literal.parse::<i64>()) {
            return self.apply_ordering(value.cmp(&literal));
        }

        if let (Ok(value), Ok(literal)) = (value.parse::<f64>(), literal.parse::<f64>()) {
            return self.apply_ordering(value.partial_cmp(&literal)?);
        }

        if let Some(literal) = literal.strip_suffix(SEMVER_SUFFIX) {
            let literal = Version::parse(literal).ok()?;
            let value = Version::parse(value).ok()?;
            return self.apply_ordering(value.cmp(&literal));
        }

        self.apply_ordering(value.cmp(literal))
    }

    fn apply_ordering(&self, ordering: Ordering) -> Option<bool> {
        Some(match self {
            Self::Equal => ordering == Ordering::Equal,
            Self::NotEqual => ordering != Ordering::Equal,
            Self::GreaterThan => ordering == Ordering::Greater,
            Self::GreaterThanInclusive => ordering != Ordering::Less,
            Self::LessThan => ordering == Ordering::Less,
            Self::LessThanInclusive => ordering != Ordering::Greater,
            _ => return None,
        })
    }
}

/// Booleans are exactly `true` and `false`, in any letter case. `1`, `0`, `t`, `f`, `yes` and `no`
/// are not booleans: they fall through to the numeric and string comparisons.
fn parse_bool(s: &str) -> Option<bool> {
    if s.eq_ignore_ascii_case("true") {
        Some(true)
    } else if s.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

fn single_literal(condition_value: &ConditionValue) -> Option<String> {
    match condition_value {
        ConditionValue::Single(value) => Some(value.to_string()),
        ConditionValue::Multiple(_) => None,
    }
}

/// Members of an `IN` literal: an explicit list, a JSON array string, or a comma-separated
/// string.
fn in_list(condition_value: &ConditionValue) -> Vec<String> {
    match condition_value {
        ConditionValue::Multiple(values) => values.iter().map(Value::to_string).collect(),
        ConditionValue::Single(Value::String(s)) => {
            if s.trim_start().starts_with('[') {
                if let Ok(values) = serde_json::from_str::<Vec<Value>>(s) {
                    return values.iter().map(Value::to_string).collect();
                }
            }
            s.split(',').map(str::to_owned).collect()
        }
        ConditionValue::Single(value) => vec![value.to_string()],
    }
}
