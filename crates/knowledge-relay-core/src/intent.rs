//! Intent classes per role and interpretation of a classifier reply.
//!
//! A turn that retrieves without naming partitions is classified into one
//! of its role's intent classes. The class decides which partitions are
//! searched; entities the classifier extracted become equality filters.
//! Anything unusable (unknown class, low confidence, no reply) falls back
//! to `general_inquiry` over the role's default partitions.
//!
//! The model call itself lives in the application crate. This module only
//! builds the prompt and interprets the parsed reply.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

use crate::models::Metadata;
use crate::partition::PartitionRegistry;

pub const GENERAL_INQUIRY: &str = "general_inquiry";
const DEFAULT_FRAME: &str = "neutral_helpful";

/// Intent classes each role may be classified into, `general_inquiry`
/// excluded.
pub fn role_intents(role: &str) -> &'static [&'static str] {
    match role {
        "driver" => &[
            "carrier_discovery",
            "carrier_intel_request",
            "compensation_discovery",
            "application_support",
            "compliance_question",
            "profile_help",
            "friction_resolution",
            "market_research",
            "personal_recall",
            "onboarding",
        ],
        "recruiter" => &[
            "driver_search",
            "pipeline_analysis",
            "candidate_intel",
            "outreach_help",
            "market_analysis",
            "campaign_management",
            "compliance_check",
            "onboarding_help",
        ],
        "admin" => &[
            "system_health",
            "data_analysis",
            "ai_performance",
            "operational_query",
            "anomaly_investigation",
        ],
        "carrier" => &[
            "driver_acquisition",
            "market_benchmarking",
            "compliance_ops",
            "profile_management",
        ],
        _ => &[],
    }
}

/// Partitions searched for an intent, most relevant first. Empty means the
/// intent is answered without retrieval.
pub fn intent_partitions(intent: &str) -> &'static [&'static str] {
    match intent {
        "carrier_discovery" => &["carrier_intel", "driver_market", "lane_market"],
        "carrier_intel_request" => &["carrier_intel"],
        "compensation_discovery" => &["driver_market", "lane_market", "carrier_intel"],
        "application_support" | "onboarding" | "campaign_management" | "onboarding_help"
        | "anomaly_investigation" | "profile_management" => &["platform_ops"],
        "compliance_question" => &["industry_regs", "platform_ops"],
        "profile_help" => &["driver_market", "platform_ops"],
        "friction_resolution" => &["driver_market", "platform_ops", "carrier_intel"],
        "market_research" => &["lane_market", "driver_market"],
        "personal_recall" => &["conversation_memory"],
        "driver_search" | "driver_acquisition" => &["driver_market"],
        "pipeline_analysis" | "outreach_help" => &["driver_market", "carrier_intel"],
        "candidate_intel" => &["conversation_memory", "driver_market"],
        "market_analysis" | "market_benchmarking" => {
            &["driver_market", "lane_market", "carrier_intel"]
        }
        "compliance_check" | "compliance_ops" => &["industry_regs"],
        _ => &[],
    }
}

/// Response register suggested for an intent.
pub fn frame_hint(intent: &str) -> &'static str {
    match intent {
        "carrier_discovery" | "driver_search" | "candidate_intel" | "outreach_help"
        | "campaign_management" | "operational_query" | "driver_acquisition"
        | "profile_management" => "direct_tactical",
        "carrier_intel_request" => "empathetic_informative",
        "compensation_discovery" | "market_research" | "pipeline_analysis" | "market_analysis"
        | "compliance_check" | "system_health" | "data_analysis" | "ai_performance"
        | "anomaly_investigation" | "market_benchmarking" => "analytical_precise",
        "application_support" | "compliance_question" | "onboarding" | "onboarding_help"
        | "compliance_ops" => "educational_clear",
        "profile_help" | "friction_resolution" => "motivational_action",
        _ => DEFAULT_FRAME,
    }
}

/// Entities the classifier pulled out of the message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Entities {
    pub carriers: Vec<String>,
    pub topics: Vec<String>,
    pub regions: Vec<String>,
    pub dot_numbers: Vec<String>,
}

impl Entities {
    fn is_empty(&self) -> bool {
        self.carriers.is_empty()
            && self.topics.is_empty()
            && self.regions.is_empty()
            && self.dot_numbers.is_empty()
    }
}

/// Outcome of classifying one message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Intent {
    pub class: String,
    pub confidence: f64,
    /// Partitions to search, most relevant first.
    pub partitions: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_hints: Vec<String>,
    pub frame_hint: String,
    #[serde(skip_serializing_if = "Entities::is_empty")]
    pub entities: Entities,
    /// Equality filters keyed by partition id.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub filters: HashMap<String, Metadata>,
    /// Set when the role defaults were used instead of a classified scope.
    pub fallback: bool,
}

impl Intent {
    /// `general_inquiry` over the role's default partitions.
    pub fn fallback(registry: &PartitionRegistry, role: &str) -> Self {
        Self {
            class: GENERAL_INQUIRY.to_string(),
            confidence: 0.0,
            partitions: registry.default_partitions(role).to_vec(),
            tool_hints: Vec::new(),
            frame_hint: DEFAULT_FRAME.to_string(),
            entities: Entities::default(),
            filters: HashMap::new(),
            fallback: true,
        }
    }
}

/// The classifier's reply object. Field names follow the JSON shape the
/// prompt asks for.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Reply {
    intent_class: String,
    confidence: f64,
    namespace_scope: Vec<String>,
    tool_priority_hints: Vec<String>,
    frame_hint: Option<String>,
    entities: Entities,
}

/// System prompt asking for a JSON classification of one message.
pub fn classifier_prompt(role: &str) -> String {
    let mut classes: Vec<&str> = role_intents(role).to_vec();
    classes.push(GENERAL_INQUIRY);

    format!(
        r#"You are an intent classifier for a CDL truck driver recruitment platform.
Classify the user's message into the most appropriate intent class.
Return ONLY a JSON object with no additional text.

User role: {role}
Available intent classes for this role:
{classes}

Rules:
- If no class has confidence >= 0.50, use "{general}"
- entities.carriers must contain exact carrier name strings only
- entities.dot_numbers must contain only numeric DOT number strings
- namespaceScope order matters: most relevant namespace first

Example:
Message: "What do other drivers say about Werner's home time?"
-> {{"intentClass":"carrier_intel_request","confidence":0.93,"namespaceScope":["carrier_intel"],"toolPriorityHints":["get_carrier_details"],"frameHint":"empathetic_informative","entities":{{"carriers":["Werner Enterprises"],"topics":["home_time"],"regions":[],"dot_numbers":[]}}}}

Return JSON with these exact fields:
{{
  "intentClass": "<class_name>",
  "confidence": <0.0 to 1.0>,
  "namespaceScope": ["<namespace1>"],
  "toolPriorityHints": ["<tool1>"],
  "frameHint": "<frame_hint_value>",
  "entities": {{ "carriers": [], "topics": [], "regions": [], "dot_numbers": [] }}
}}"#,
        role = role,
        classes = classes.join(", "),
        general = GENERAL_INQUIRY,
    )
}

/// Turn a parsed classifier reply into an [`Intent`].
///
/// - A class outside the role's list becomes `general_inquiry` with
///   confidence `0`.
/// - `general_inquiry` or confidence below `min_confidence` falls back to
///   the role defaults.
/// - The reply's own scope is used when it names partitions the role may
///   search; otherwise the class's partition list, restricted the same
///   way. A class whose list is empty by design keeps an empty scope.
pub fn interpret(
    registry: &PartitionRegistry,
    role: &str,
    reply: &Value,
    min_confidence: f64,
) -> Intent {
    let Ok(reply) = serde_json::from_value::<Reply>(reply.clone()) else {
        return Intent::fallback(registry, role);
    };

    let valid = role_intents(role).contains(&reply.intent_class.as_str());
    let confidence = if valid {
        reply.confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };
    if !valid || confidence < min_confidence {
        let mut intent = Intent::fallback(registry, role);
        intent.confidence = confidence;
        return intent;
    }

    let class = reply.intent_class;
    let mut partitions = permitted(registry, role, reply.namespace_scope.iter().map(String::as_str));
    let mut fallback = false;
    if partitions.is_empty() {
        let mapped = intent_partitions(&class);
        partitions = permitted(registry, role, mapped.iter().copied());
        if partitions.is_empty() && !mapped.is_empty() {
            partitions = registry.default_partitions(role).to_vec();
            fallback = true;
        }
    }

    let filters = entity_filters(&reply.entities, &partitions);
    let frame = reply
        .frame_hint
        .filter(|f| !f.trim().is_empty())
        .unwrap_or_else(|| frame_hint(&class).to_string());

    Intent {
        class,
        confidence,
        partitions,
        tool_hints: reply.tool_priority_hints,
        frame_hint: frame,
        entities: reply.entities,
        filters,
        fallback,
    }
}

/// Known partitions `role` may search, deduplicated, in order.
fn permitted<'a>(
    registry: &PartitionRegistry,
    role: &str,
    ids: impl Iterator<Item = &'a str>,
) -> Vec<String> {
    let mut seen = BTreeSet::new();
    ids.filter(|id| registry.has_access(role, id) && seen.insert(*id))
        .map(str::to_string)
        .collect()
}

/// Carrier entities narrow `carrier_intel` when it is in scope. A DOT
/// number is more precise than a name and wins.
pub fn entity_filters(entities: &Entities, partitions: &[String]) -> HashMap<String, Metadata> {
    let mut filters = HashMap::new();
    if !partitions.iter().any(|p| p == "carrier_intel") {
        return filters;
    }

    let dot = entities
        .dot_numbers
        .iter()
        .map(|d| d.trim())
        .find(|d| !d.is_empty() && d.chars().all(|c| c.is_ascii_digit()));
    let carrier = entities
        .carriers
        .iter()
        .map(|c| c.trim())
        .find(|c| !c.is_empty());

    let mut filter = Metadata::new();
    if let Some(dot) = dot {
        filter.insert("dot_number".into(), Value::String(dot.to_string()));
    } else if let Some(name) = carrier {
        filter.insert("carrier_name".into(), Value::String(name.to_string()));
    }
    if !filter.is_empty() {
        filters.insert("carrier_intel".to_string(), filter);
    }
    filters
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> PartitionRegistry {
        PartitionRegistry::builtin()
    }

    #[test]
    fn test_every_role_intent_has_a_frame() {
        for role in ["driver", "recruiter", "admin", "carrier"] {
            for intent in role_intents(role) {
                assert_ne!(*intent, GENERAL_INQUIRY);
                assert!(!frame_hint(intent).is_empty());
            }
        }
        assert!(role_intents("b2b").is_empty());
    }

    #[test]
    fn test_confident_class_uses_its_partitions() {
        let reply = json!({"intentClass": "compliance_question", "confidence": 0.94});
        let intent = interpret(&registry(), "driver", &reply, 0.5);
        assert_eq!(intent.class, "compliance_question");
        assert_eq!(intent.partitions, vec!["industry_regs", "platform_ops"]);
        assert_eq!(intent.frame_hint, "educational_clear");
        assert!(!intent.fallback);
    }

    #[test]
    fn test_reply_scope_is_restricted_to_role() {
        // Carriers may not read industry_regs; unknown ids are dropped.
        let reply = json!({
            "intentClass": "compliance_ops",
            "confidence": 0.9,
            "namespaceScope": ["industry_regs", "nope", "platform_ops", "platform_ops"]
        });
        let intent = interpret(&registry(), "carrier", &reply, 0.5);
        assert_eq!(intent.partitions, vec!["platform_ops"]);

        // Nothing usable in the reply scope or the class list: role defaults.
        let reply = json!({"intentClass": "compliance_ops", "confidence": 0.9, "namespaceScope": ["nope"]});
        let intent = interpret(&registry(), "carrier", &reply, 0.5);
        assert!(intent.fallback);
        assert_eq!(intent.partitions, registry().default_partitions("carrier"));
    }

    #[test]
    fn test_low_confidence_and_unknown_class_fall_back() {
        let reg = registry();
        let low = interpret(&reg, "driver", &json!({"intentClass": "market_research", "confidence": 0.3}), 0.5);
        assert_eq!(low.class, GENERAL_INQUIRY);
        assert!(low.fallback);
        assert_eq!(low.partitions, reg.default_partitions("driver"));
        assert!((low.confidence - 0.3).abs() < 1e-9);

        let foreign = interpret(&reg, "driver", &json!({"intentClass": "system_health", "confidence": 0.99}), 0.5);
        assert_eq!(foreign.class, GENERAL_INQUIRY);
        assert_eq!(foreign.confidence, 0.0);

        let garbage = interpret(&reg, "driver", &json!({"confidence": "high"}), 0.5);
        assert!(garbage.fallback);
    }

    #[test]
    fn test_retrieval_free_intent_keeps_empty_scope() {
        let intent = interpret(&registry(), "admin", &json!({"intentClass": "system_health", "confidence": 0.95}), 0.5);
        assert!(intent.partitions.is_empty());
        assert!(!intent.fallback);
    }

    #[test]
    fn test_entity_filters_prefer_dot_number() {
        let reply = json!({
            "intentClass": "carrier_intel_request",
            "confidence": 0.93,
            "entities": {"carriers": ["Werner Enterprises"], "dot_numbers": ["53467"]}
        });
        let intent = interpret(&registry(), "driver", &reply, 0.5);
        assert_eq!(intent.filters["carrier_intel"]["dot_number"], "53467");

        let by_name = entity_filters(
            &Entities {
                carriers: vec!["Werner Enterprises".into()],
                dot_numbers: vec!["DOT-1".into()],
                ..Default::default()
            },
            &["carrier_intel".to_string()],
        );
        assert_eq!(by_name["carrier_intel"]["carrier_name"], "Werner Enterprises");

        let out_of_scope = entity_filters(
            &Entities {
                carriers: vec!["Werner".into()],
                ..Default::default()
            },
            &["driver_market".to_string()],
        );
        assert!(out_of_scope.is_empty());
    }

    #[test]
    fn test_prompt_lists_role_classes() {
        let prompt = classifier_prompt("recruiter");
        assert!(prompt.contains("driver_search"));
        assert!(prompt.contains(GENERAL_INQUIRY));
        assert!(!prompt.contains("carrier_discovery,"));
    }
}
