//! Intent classification and rule-based handler routing.
//!
//! A request is first classified into an [`Intent`] with a confidence score
//! and a detected [`Language`]. The [`RoutingEngine`] then evaluates its
//! prioritized [`RoutingRule`]s against that classification to pick one of
//! the currently available handlers, falling back to a language mapping and
//! finally to a default handler type.
//!
//! # Main types
//!
//! - [`IntentClassifier`] - Keyword-based, deterministic intent classifier.
//! - [`Classification`] - Immutable classification result.
//! - [`RoutingRule`] / [`RuleCondition`] - Declarative routing rules.
//! - [`RoutingEngine`] - Resolves a classification to a [`RoutingDecision`].

/// Intent and language classification.
pub mod classifier;
/// Routing engine and decisions.
pub mod engine;
/// Rule and condition definitions.
pub mod rules;

pub use classifier::{
    detect_language, Classification, Intent, IntentAlternative, IntentClassifier, Language,
    UNKNOWN_CONFIDENCE,
};
pub use engine::{handler_type_for_language, RoutingConfig, RoutingDecision, RoutingEngine};
pub use rules::{default_rules, ConditionField, ConditionOperator, RoutingRule, RuleCondition};
