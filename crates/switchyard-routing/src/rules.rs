use crate::classifier::{Classification, Intent};
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::sync::OnceLock;
use switchyard_core::{HandlerType, SwitchyardError, SwitchyardResult};
use tracing::warn;
use uuid::Uuid;

/// Classification field a condition reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionField {
    /// Intent label.
    Intent,
    /// Language label.
    Language,
    /// Classification confidence.
    Confidence,
    /// Holds if any matched keyword satisfies the operator.
    Keywords,
    /// Number of matched keywords.
    KeywordCount,
    /// Holds if any alternative intent label satisfies the operator.
    Alternatives,
}

/// Comparison a condition applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    /// Equal after optional case folding.
    Equals,
    /// Not equal; over a collection, no element is equal.
    NotEquals,
    /// Substring match.
    Contains,
    /// Prefix match.
    StartsWith,
    /// Suffix match.
    EndsWith,
    /// Regular expression match.
    Regex,
    /// Numeric greater-than.
    GreaterThan,
    /// Numeric less-than.
    LessThan,
    /// `value` is a comma-separated list.
    In,
}

/// Compiled form of a regex condition, filled on validation or first use.
/// Ignored by equality and serialization.
#[derive(Clone, Default)]
struct CompiledRegex(OnceLock<(bool, Regex)>);

impl fmt::Debug for CompiledRegex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.get().is_some() { "compiled" } else { "pending" })
    }
}

impl PartialEq for CompiledRegex {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

/// A single predicate over a [`Classification`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    /// Classification field to read.
    pub field: ConditionField,
    /// Comparison applied to the field.
    pub operator: ConditionOperator,
    /// Operand: literal, threshold, pattern or comma-separated list.
    pub value: String,
    /// Compare without case folding.
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(skip)]
    compiled: CompiledRegex,
}

impl RuleCondition {
    /// Case-insensitive condition.
    pub fn new(field: ConditionField, operator: ConditionOperator, value: impl Into<String>) -> Self {
        Self {
            field,
            operator,
            value: value.into(),
            case_sensitive: false,
            compiled: CompiledRegex::default(),
        }
    }

    /// Compare without case folding.
    pub fn case_sensitive(mut self) -> Self {
        self.case_sensitive = true;
        self
    }

    /// Reject conditions that can never be evaluated (bad regex, non-numeric threshold).
    pub fn validate(&self) -> SwitchyardResult<()> {
        match self.operator {
            ConditionOperator::Regex => {
                self.regex().map_err(|e| {
                    SwitchyardError::Validation(format!("Invalid regex '{}': {e}", self.value))
                })?;
            }
            ConditionOperator::GreaterThan | ConditionOperator::LessThan => {
                self.value.trim().parse::<f64>().map_err(|_| {
                    SwitchyardError::Validation(format!(
                        "Threshold '{}' is not a number",
                        self.value
                    ))
                })?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Evaluate this condition against a classification.
    pub fn holds(&self, classification: &Classification) -> bool {
        match self.field {
            ConditionField::Intent => self.test(classification.intent.as_str()),
            ConditionField::Language => self.test(classification.language.as_str()),
            ConditionField::Confidence => self.test_number(classification.confidence),
            ConditionField::KeywordCount => self.test_number(classification.keywords.len() as f64),
            ConditionField::Keywords => self.test_any(classification.keywords.iter().map(String::as_str)),
            ConditionField::Alternatives => {
                self.test_any(classification.alternatives.iter().map(|a| a.intent.as_str()))
            }
        }
    }

    fn test_any<'a>(&self, mut values: impl Iterator<Item = &'a str>) -> bool {
        // A negated operator over a collection holds only if no element equals the value.
        if self.operator == ConditionOperator::NotEquals {
            let expected = self.fold(&self.value);
            return values.all(|v| self.fold(v) != expected);
        }
        values.any(|v| self.test(v))
    }

    fn test(&self, actual: &str) -> bool {
        let actual_f = self.fold(actual);
        let expected = self.fold(&self.value);
        match self.operator {
            ConditionOperator::Equals => actual_f == expected,
            ConditionOperator::NotEquals => actual_f != expected,
            ConditionOperator::Contains => actual_f.contains(&expected),
            ConditionOperator::StartsWith => actual_f.starts_with(&expected),
            ConditionOperator::EndsWith => actual_f.ends_with(&expected),
            ConditionOperator::In => expected
                .split(',')
                .map(str::trim)
                .any(|candidate| candidate == actual_f),
            ConditionOperator::Regex => match self.regex() {
                Ok(re) => re.is_match(actual),
                Err(e) => {
                    warn!(pattern = %self.value, error = %e, "Skipping condition with invalid regex");
                    false
                }
            },
            ConditionOperator::GreaterThan | ConditionOperator::LessThan => actual
                .trim()
                .parse::<f64>()
                .map(|n| self.test_number(n))
                .unwrap_or(false),
        }
    }

    /// The compiled pattern, cached after the first successful build. A
    /// cached entry is reused only while `value` and `case_sensitive` still
    /// match it.
    fn regex(&self) -> Result<Cow<'_, Regex>, regex::Error> {
        if let Some((case_sensitive, re)) = self.compiled.0.get() {
            if *case_sensitive == self.case_sensitive && re.as_str() == self.value {
                return Ok(Cow::Borrowed(re));
            }
            return self.build_regex().map(Cow::Owned);
        }
        let re = self.build_regex()?;
        let _ = self.compiled.0.set((self.case_sensitive, re.clone()));
        Ok(Cow::Owned(re))
    }

    fn build_regex(&self) -> Result<Regex, regex::Error> {
        RegexBuilder::new(&self.value)
            .case_insensitive(!self.case_sensitive)
            .build()
    }

    /// True once the regex has been compiled and cached.
    pub fn is_compiled(&self) -> bool {
        self.compiled.0.get().is_some()
    }

    fn test_number(&self, actual: f64) -> bool {
        match self.operator {
            ConditionOperator::GreaterThan | ConditionOperator::LessThan => {
                let Ok(threshold) = self.value.trim().parse::<f64>() else {
                    return false;
                };
                if self.operator == ConditionOperator::GreaterThan {
                    actual > threshold
                } else {
                    actual < threshold
                }
            }
            ConditionOperator::Equals => self
                .value
                .trim()
                .parse::<f64>()
                .map(|v| (v - actual).abs() < f64::EPSILON)
                .unwrap_or(false),
            _ => self.test(&actual.to_string()),
        }
    }

    fn fold(&self, s: &str) -> String {
        if self.case_sensitive {
            s.to_string()
        } else {
            s.to_lowercase()
        }
    }
}

/// A prioritized routing rule.
///
/// A rule matches when it is enabled and every condition holds. An explicit
/// `target_handler` name takes precedence over `target_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Stable rule id.
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Unique, human-readable name.
    pub name: String,
    /// Higher priorities are evaluated first.
    #[serde(default)]
    pub priority: i32,
    /// Disabled rules never match.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// All must hold for the rule to match.
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    /// Handler type to route to.
    #[serde(default)]
    pub target_type: Option<HandlerType>,
    /// Handler name to route to; wins over `target_type`.
    #[serde(default)]
    pub target_handler: Option<String>,
    /// Added to the base confidence when the rule wins.
    #[serde(default)]
    pub confidence_boost: f64,
    /// Outcomes recorded for this rule.
    #[serde(default)]
    pub times_applied: u64,
    /// Running share of successful outcomes.
    #[serde(default)]
    pub success_rate: f64,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl RoutingRule {
    /// Enabled rule without conditions or target.
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            priority,
            enabled: true,
            conditions: Vec::new(),
            target_type: None,
            target_handler: None,
            confidence_boost: 0.0,
            times_applied: 0,
            success_rate: 0.0,
            created_at: Utc::now(),
        }
    }

    /// Add a condition.
    pub fn when(mut self, condition: RuleCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Route to a handler type.
    pub fn targeting_type(mut self, handler_type: HandlerType) -> Self {
        self.target_type = Some(handler_type);
        self
    }

    /// Route to a named handler.
    pub fn targeting_handler(mut self, name: impl Into<String>) -> Self {
        self.target_handler = Some(name.into());
        self
    }

    /// Set the confidence boost.
    pub fn with_boost(mut self, boost: f64) -> Self {
        self.confidence_boost = boost;
        self
    }

    /// Create the rule disabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Reject unnamed rules, rules without a target and invalid conditions.
    pub fn validate(&self) -> SwitchyardResult<()> {
        if self.name.trim().is_empty() {
            return Err(SwitchyardError::Validation("Rule name must not be empty".into()));
        }
        if self.target_type.is_none() && self.target_handler.is_none() {
            return Err(SwitchyardError::Validation(format!(
                "Rule '{}' has neither a target type nor a target handler",
                self.name
            )));
        }
        if !self.confidence_boost.is_finite() {
            return Err(SwitchyardError::Validation(format!(
                "Rule '{}' has a non-finite confidence boost",
                self.name
            )));
        }
        self.conditions.iter().try_for_each(RuleCondition::validate)
    }

    /// True when enabled and every condition holds.
    pub fn matches(&self, classification: &Classification) -> bool {
        self.enabled && self.conditions.iter().all(|c| c.holds(classification))
    }

    /// Fold one outcome into the running success rate.
    pub fn record_outcome(&mut self, success: bool) {
        self.times_applied += 1;
        let n = self.times_applied as f64;
        let sample = if success { 1.0 } else { 0.0 };
        self.success_rate += (sample - self.success_rate) / n;
    }
}

/// One rule per classifiable intent, mapping it to the handler type that serves it.
pub fn default_rules() -> Vec<RoutingRule> {
    let table: [(Intent, HandlerType, f64); 8] = [
        (Intent::FixError, HandlerType::Fixer, 0.1),
        (Intent::Refactor, HandlerType::Refactor, 0.1),
        (Intent::GenerateTests, HandlerType::TestGenerator, 0.1),
        (Intent::Explain, HandlerType::Knowledge, 0.05),
        (Intent::Optimize, HandlerType::Analyzer, 0.05),
        (Intent::Document, HandlerType::Documenter, 0.05),
        (Intent::Review, HandlerType::Validator, 0.05),
        (Intent::Generate, HandlerType::Designer, 0.05),
    ];
    table
        .iter()
        .map(|(intent, handler_type, boost)| {
            RoutingRule::new(format!("default:{intent}"), 10)
                .when(RuleCondition::new(
                    ConditionField::Intent,
                    ConditionOperator::Equals,
                    intent.as_str(),
                ))
                .targeting_type(*handler_type)
                .with_boost(*boost)
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::classifier::{IntentAlternative, Language};
    use ConditionField as F;
    use ConditionOperator as Op;

    fn classification() -> Classification {
        Classification {
            intent: Intent::FixError,
            confidence: 0.7,
            language: Language::CSharp,
            keywords: vec!["fix".into(), "null reference".into()],
            alternatives: vec![IntentAlternative {
                intent: Intent::Refactor,
                confidence: 0.4,
                matched: 1,
            }],
        }
    }

    fn cond(field: ConditionField, op: ConditionOperator, value: &str) -> RuleCondition {
        RuleCondition::new(field, op, value)
    }

    #[test]
    fn test_string_operators() {
        let c = classification();
        assert!(cond(F::Intent, Op::Equals, "FIX_ERROR").holds(&c));
        assert!(!cond(F::Intent, Op::Equals, "FIX_ERROR").case_sensitive().holds(&c));
        assert!(cond(F::Intent, Op::NotEquals, "refactor").holds(&c));
        assert!(cond(F::Language, Op::StartsWith, "cs").holds(&c));
        assert!(cond(F::Language, Op::EndsWith, "sharp").holds(&c));
        assert!(cond(F::Language, Op::Contains, "sha").holds(&c));
        assert!(cond(F::Language, Op::In, "python, csharp ,rust").holds(&c));
        assert!(!cond(F::Language, Op::In, "python,rust").holds(&c));
        assert!(cond(F::Intent, Op::Regex, "^fix_").holds(&c));
        assert!(!cond(F::Intent, Op::Regex, "^FIX_").case_sensitive().holds(&c));
    }

    #[test]
    fn test_numeric_operators() {
        let c = classification();
        assert!(cond(F::Confidence, Op::GreaterThan, "0.5").holds(&c));
        assert!(!cond(F::Confidence, Op::LessThan, "0.5").holds(&c));
        assert!(cond(F::KeywordCount, Op::GreaterThan, "1").holds(&c));
        assert!(cond(F::KeywordCount, Op::Equals, "2").holds(&c));
        assert!(!cond(F::Confidence, Op::GreaterThan, "abc").holds(&c));
    }

    #[test]
    fn test_collection_fields() {
        let c = classification();
        assert!(cond(F::Keywords, Op::Contains, "null").holds(&c));
        assert!(cond(F::Keywords, Op::Equals, "fix").holds(&c));
        assert!(!cond(F::Keywords, Op::NotEquals, "fix").holds(&c));
        assert!(cond(F::Keywords, Op::NotEquals, "crash").holds(&c));
        assert!(cond(F::Alternatives, Op::Equals, "refactor").holds(&c));
        assert!(!cond(F::Alternatives, Op::Equals, "review").holds(&c));
    }

    #[test]
    fn test_validate_rejects_bad_rules() {
        let bad_regex = RoutingRule::new("r", 1)
            .targeting_type(HandlerType::Fixer)
            .when(cond(ConditionField::Intent, ConditionOperator::Regex, "(unclosed"));
        assert!(bad_regex.validate().is_err());

        let no_target = RoutingRule::new("r", 1);
        assert!(no_target.validate().is_err());

        let bad_threshold = RoutingRule::new("r", 1)
            .targeting_type(HandlerType::Fixer)
            .when(cond(ConditionField::Confidence, ConditionOperator::LessThan, "high"));
        assert!(bad_threshold.validate().is_err());

        let ok = RoutingRule::new("r", 1).targeting_handler("fixer-1");
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_disabled_rule_never_matches() {
        let rule = RoutingRule::new("any", 1)
            .targeting_type(HandlerType::Fixer)
            .disabled();
        assert!(!rule.matches(&classification()));
    }

    #[test]
    fn test_rule_without_conditions_matches_everything() {
        let rule = RoutingRule::new("catch-all", 0).targeting_type(HandlerType::Generic);
        assert!(rule.matches(&classification()));
    }

    #[test]
    fn test_running_success_rate() {
        let mut rule = RoutingRule::new("r", 1).targeting_type(HandlerType::Fixer);
        rule.record_outcome(true);
        rule.record_outcome(true);
        rule.record_outcome(false);
        rule.record_outcome(true);
        assert_eq!(rule.times_applied, 4);
        assert!((rule.success_rate - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_default_rules_cover_every_intent() {
        let rules = default_rules();
        assert_eq!(rules.len(), Intent::RANKED.len());
        for rule in &rules {
            rule.validate().unwrap();
        }
        let fix = rules
            .iter()
            .find(|r| r.name == "default:fix_error")
            .unwrap();
        assert_eq!(fix.target_type, Some(HandlerType::Fixer));
        assert!(fix.matches(&classification()));
    }

    #[test]
    fn test_rule_deserializes_with_defaults() {
        let rule: RoutingRule = serde_json::from_value(serde_json::json!({
            "name": "python-to-python",
            "priority": 50,
            "conditions": [
                {"field": "language", "operator": "equals", "value": "python"}
            ],
            "target_type": "python"
        }))
        .unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.times_applied, 0);
        assert_eq!(rule.target_type, Some(HandlerType::Python));
        assert!(!rule.conditions[0].case_sensitive);
    }

    #[test]
    fn test_regex_compiled_once_and_refreshed_on_edit() {
        let c = classification();
        let mut condition = cond(F::Language, Op::Regex, "^c.*p$");
        assert!(!condition.is_compiled());
        condition.validate().unwrap();
        assert!(condition.is_compiled());
        assert!(condition.holds(&c));

        let copy = condition.clone();
        assert!(copy.is_compiled());
        assert_eq!(copy, condition);

        condition.value = "^rust$".into();
        assert!(!condition.holds(&c));
        condition.value = "^CSHARP$".into();
        assert!(condition.holds(&c));
        assert!(!condition.clone().case_sensitive().holds(&c));
    }
}
