#![allow(clippy::unwrap_used, clippy::expect_used)]

use switchyard_core::{HandlerDescriptor, HandlerType, Request};
use switchyard_routing::{
    ConditionField, ConditionOperator, Intent, IntentClassifier, Language, RoutingConfig,
    RoutingEngine, RoutingRule, RuleCondition,
};

fn pool() -> Vec<HandlerDescriptor> {
    vec![
        HandlerDescriptor::new("csharp-specialist", HandlerType::CSharp),
        HandlerDescriptor::new("fixer", HandlerType::Fixer),
        HandlerDescriptor::new("generic", HandlerType::Generic),
    ]
}

#[test]
fn null_reference_fix_in_csharp_goes_to_fixer() {
    let classifier = IntentClassifier::new();
    let engine = RoutingEngine::with_default_rules();

    let request = Request::new("Fix the null reference error").with_file_path("src/Foo.cs");
    let classification = classifier.classify(&request);
    assert_eq!(classification.intent, Intent::FixError);
    assert_eq!(classification.language, Language::CSharp);
    assert!(classification.confidence > 0.3);

    let decision = engine.route(&classification, &pool(), None).unwrap();
    assert_eq!(decision.handler_type, HandlerType::Fixer);
    assert!(decision.confidence >= classification.confidence);
    assert!(!decision.is_fallback);
}

#[test]
fn unknown_intent_still_routes() {
    let classifier = IntentClassifier::new();
    let engine = RoutingEngine::with_default_rules();

    let request = Request::new("hello there").with_file_path("Program.cs");
    let classification = classifier.classify(&request);
    assert_eq!(classification.intent, Intent::Unknown);

    let decision = engine.route(&classification, &pool(), None).unwrap();
    assert!(decision.is_fallback);
    assert_eq!(decision.handler_name, "csharp-specialist");
}

#[test]
fn classification_is_deterministic() {
    let classifier = IntentClassifier::new();
    let request = Request::new("Please refactor and document this module");
    let a = classifier.classify(&request);
    let b = classifier.classify(&request);
    assert_eq!(a, b);
}

#[test]
fn custom_rule_from_config_outranks_defaults() {
    let rule = RoutingRule::new("python fixes", 50)
        .when(RuleCondition::new(
            ConditionField::Language,
            ConditionOperator::Equals,
            "python",
        ))
        .when(RuleCondition::new(
            ConditionField::Intent,
            ConditionOperator::Equals,
            "fix_error",
        ))
        .targeting_type(HandlerType::Python)
        .with_boost(0.2);

    let engine = RoutingEngine::new(RoutingConfig {
        rules: vec![rule],
        ..RoutingConfig::default()
    })
    .unwrap();

    let mut available = pool();
    available.push(HandlerDescriptor::new("py", HandlerType::Python));

    let classification = IntentClassifier::new()
        .classify(&Request::new("fix this crash").with_file_path("app/main.py"));
    let decision = engine.route(&classification, &available, None).unwrap();
    assert_eq!(decision.handler_name, "py");
    assert!(decision.reason.contains("python fixes"));
}

#[test]
fn rules_deserialize_from_toml_shaped_json() {
    let config: RoutingConfig = serde_json::from_value(serde_json::json!({
        "use_default_rules": false,
        "rules": [{
            "name": "reviews",
            "priority": 7,
            "conditions": [
                { "field": "intent", "operator": "equals", "value": "review" }
            ],
            "target_type": "validator"
        }]
    }))
    .unwrap();
    let engine = RoutingEngine::new(config).unwrap();
    assert_eq!(engine.rule_count(), 1);

    let classification = IntentClassifier::new().classify(&Request::new("review my code"));
    let decision = engine
        .route(
            &classification,
            &[HandlerDescriptor::new("checker", HandlerType::Validator)],
            None,
        )
        .unwrap();
    assert_eq!(decision.handler_name, "checker");
}
