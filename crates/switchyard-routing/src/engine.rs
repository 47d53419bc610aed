use crate::classifier::{Classification, Language};
use crate::rules::{default_rules, RoutingRule};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use switchyard_core::{HandlerDescriptor, HandlerType, SwitchyardError, SwitchyardResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Resolved target for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Handler chosen.
    pub handler_name: String,
    /// Type of the chosen handler.
    pub handler_type: HandlerType,
    /// Base confidence plus any rule boost, clipped to [0, 1].
    pub confidence: f64,
    /// Why this handler was chosen.
    pub reason: String,
    /// True unless a preference or rule picked the handler.
    pub is_fallback: bool,
    /// Rule that produced the decision, if any.
    pub rule_id: Option<Uuid>,
    /// Extra detail such as an unavailable rule target.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Routing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Last-resort handler type when neither a rule nor the language mapping applies.
    #[serde(default = "default_handler_type")]
    pub default_handler_type: HandlerType,
    /// Multiplier applied to the base confidence on fallback routes. Must
    /// lie in `[0, 1)` so a fallback always scores below a matched rule.
    #[serde(default = "default_fallback_penalty")]
    pub fallback_penalty: f64,
    /// Seed the per-intent default rules.
    #[serde(default = "default_use_default_rules")]
    pub use_default_rules: bool,
    /// Extra rules added after the defaults.
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
}

fn default_handler_type() -> HandlerType {
    HandlerType::Generic
}

fn default_fallback_penalty() -> f64 {
    0.8
}

fn default_use_default_rules() -> bool {
    true
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_handler_type: default_handler_type(),
            fallback_penalty: default_fallback_penalty(),
            use_default_rules: default_use_default_rules(),
            rules: Vec::new(),
        }
    }
}

/// Rule-based router.
///
/// Rules are kept sorted by descending priority; equal priorities keep
/// insertion order. The first matching rule wins.
pub struct RoutingEngine {
    rules: RwLock<Vec<RoutingRule>>,
    default_handler_type: HandlerType,
    fallback_penalty: f64,
}

impl RoutingEngine {
    /// Build an engine from config, validating every rule.
    pub fn new(config: RoutingConfig) -> SwitchyardResult<Self> {
        if !(0.0..1.0).contains(&config.fallback_penalty) {
            return Err(SwitchyardError::Config(format!(
                "fallback_penalty must be within [0, 1), got {}",
                config.fallback_penalty
            )));
        }
        let engine = Self {
            rules: RwLock::new(Vec::new()),
            default_handler_type: config.default_handler_type,
            fallback_penalty: config.fallback_penalty,
        };
        if config.use_default_rules {
            for rule in default_rules() {
                engine.add_rule(rule)?;
            }
        }
        for rule in config.rules {
            engine.add_rule(rule)?;
        }
        Ok(engine)
    }

    /// Engine with the default per-intent rules.
    pub fn with_default_rules() -> Self {
        let rules = default_rules();
        let mut engine = Self::empty();
        engine.rules = RwLock::new(rules);
        engine
    }

    /// Engine with no rules; every decision goes through the fallback chain.
    pub fn empty() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            default_handler_type: default_handler_type(),
            fallback_penalty: default_fallback_penalty(),
        }
    }

    /// Validate and insert a rule. Duplicate ids are rejected.
    pub fn add_rule(&self, rule: RoutingRule) -> SwitchyardResult<Uuid> {
        rule.validate()?;
        let id = rule.id;
        let mut rules = self.rules.write();
        if rules.iter().any(|r| r.id == id) {
            return Err(SwitchyardError::Validation(format!("Duplicate rule id {id}")));
        }
        info!(rule = %rule.name, priority = rule.priority, "Routing rule added");
        rules.push(rule);
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(id)
    }

    /// Remove a rule. False if no rule has that id.
    pub fn remove_rule(&self, id: Uuid) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.id != id);
        rules.len() != before
    }

    /// Enable or disable a rule. False if no rule has that id.
    pub fn set_enabled(&self, id: Uuid, enabled: bool) -> bool {
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|r| r.id == id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Snapshot of all rules in evaluation order.
    pub fn rules(&self) -> Vec<RoutingRule> {
        self.rules.read().clone()
    }

    /// Number of rules, enabled or not.
    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }

    /// Fold an eventual handler outcome into the rule's usage counters.
    pub fn record_outcome(&self, rule_id: Uuid, success: bool) -> bool {
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|r| r.id == rule_id) {
            Some(rule) => {
                rule.record_outcome(success);
                true
            }
            None => false,
        }
    }

    /// Pick a handler for a classification among the available handlers.
    ///
    /// Order: explicit preference, highest-priority matching rule, language
    /// mapping, default handler type. Only the last step can fail.
    pub fn route(
        &self,
        classification: &Classification,
        available: &[HandlerDescriptor],
        preferred: Option<HandlerType>,
    ) -> SwitchyardResult<RoutingDecision> {
        let base = classification.confidence.clamp(0.0, 1.0);

        if let Some(handler_type) = preferred {
            if let Some(handler) = first_of_type(available, handler_type) {
                debug!(handler = %handler.name, "Routing by explicit preference");
                return Ok(RoutingDecision {
                    handler_name: handler.name.clone(),
                    handler_type: handler.handler_type,
                    confidence: base,
                    reason: format!("Preferred handler type '{handler_type}'"),
                    is_fallback: false,
                    rule_id: None,
                    metadata: HashMap::new(),
                });
            }
            warn!(handler_type = %handler_type, "Preferred handler type unavailable, evaluating rules");
        }

        let mut metadata = HashMap::new();
        let winner = {
            let rules = self.rules.read();
            rules.iter().find(|r| r.matches(classification)).cloned()
        };

        if let Some(rule) = winner {
            let target = match (&rule.target_handler, rule.target_type) {
                (Some(name), _) => available.iter().find(|h| &h.name == name),
                (None, Some(handler_type)) => first_of_type(available, handler_type),
                (None, None) => None,
            };
            if let Some(handler) = target {
                let confidence = (base + rule.confidence_boost).clamp(0.0, 1.0);
                debug!(rule = %rule.name, handler = %handler.name, confidence, "Rule matched");
                metadata.insert("rule_name".to_string(), serde_json::json!(rule.name));
                return Ok(RoutingDecision {
                    handler_name: handler.name.clone(),
                    handler_type: handler.handler_type,
                    confidence,
                    reason: format!("Matched rule '{}'", rule.name),
                    is_fallback: false,
                    rule_id: Some(rule.id),
                    metadata,
                });
            }
            warn!(rule = %rule.name, "Matched rule targets no available handler, falling back");
            metadata.insert("unavailable_rule".to_string(), serde_json::json!(rule.name));
        }

        let fallback_confidence = (base * self.fallback_penalty).clamp(0.0, 1.0);

        if let Some(handler_type) = handler_type_for_language(classification.language) {
            if let Some(handler) = first_of_type(available, handler_type) {
                info!(language = %classification.language, handler = %handler.name, "Routing by language fallback");
                metadata.insert("fallback_stage".to_string(), serde_json::json!("language"));
                return Ok(RoutingDecision {
                    handler_name: handler.name.clone(),
                    handler_type: handler.handler_type,
                    confidence: fallback_confidence,
                    reason: format!(
                        "No rule applied; routed by language '{}'",
                        classification.language
                    ),
                    is_fallback: true,
                    rule_id: None,
                    metadata,
                });
            }
        }

        if let Some(handler) = first_of_type(available, self.default_handler_type) {
            info!(handler = %handler.name, "Routing to default handler type");
            metadata.insert("fallback_stage".to_string(), serde_json::json!("default"));
            return Ok(RoutingDecision {
                handler_name: handler.name.clone(),
                handler_type: handler.handler_type,
                confidence: fallback_confidence,
                reason: format!(
                    "No rule applied; routed to default handler type '{}'",
                    self.default_handler_type
                ),
                is_fallback: true,
                rule_id: None,
                metadata,
            });
        }

        Err(SwitchyardError::Routing(format!(
            "No handler available for intent '{}' (language '{}', default type '{}')",
            classification.intent, classification.language, self.default_handler_type
        )))
    }
}

impl Default for RoutingEngine {
    fn default() -> Self {
        Self::with_default_rules()
    }
}

fn first_of_type(available: &[HandlerDescriptor], handler_type: HandlerType) -> Option<&HandlerDescriptor> {
    available.iter().find(|h| h.handler_type == handler_type)
}

/// Direct language to language-specialist mapping used on fallback.
pub fn handler_type_for_language(language: Language) -> Option<HandlerType> {
    match language {
        Language::CSharp => Some(HandlerType::CSharp),
        Language::JavaScript | Language::TypeScript => Some(HandlerType::JavaScript),
        Language::Python => Some(HandlerType::Python),
        Language::Rust => Some(HandlerType::Rust),
        _ => None,
    }
}
