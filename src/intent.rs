//! Intent classification through the generation backend.
//!
//! [`IntentClassifier::classify`] never fails: a disabled backend, a
//! timeout, an error, or an unparsable reply all yield the role-default
//! fallback from [`Intent::fallback`].

use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use knowledge_relay_core::intent::{classifier_prompt, interpret, Intent};
use knowledge_relay_core::partition::PartitionRegistry;

use crate::config::IntentConfig;
use crate::provider::{GenerationProvider, GenerationRequest, Message, ProviderError};
use crate::research::extract_json_object;

/// Messages are cut to this many characters before classification.
const MAX_MESSAGE_CHARS: usize = 500;

pub struct IntentClassifier {
    provider: Arc<dyn GenerationProvider>,
    registry: Arc<PartitionRegistry>,
    enabled: bool,
    model: Option<String>,
    timeout: Duration,
    min_confidence: f64,
    max_tokens: u32,
}

impl IntentClassifier {
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        registry: Arc<PartitionRegistry>,
        config: &IntentConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            enabled: config.enabled,
            model: config.model.clone(),
            timeout: config.timeout(),
            min_confidence: config.min_confidence,
            max_tokens: config.max_tokens,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Classify `message` for `role`. `recent` holds short summaries of the
    /// preceding turns.
    pub async fn classify(&self, message: &str, role: &str, recent: &[String]) -> Intent {
        let started = Instant::now();

        let mut content: String = message.chars().take(MAX_MESSAGE_CHARS).collect();
        if !recent.is_empty() {
            content.push_str("\n\nRecent conversation context:");
            for line in recent {
                content.push_str("\n- ");
                content.push_str(line);
            }
        }
        let request = GenerationRequest {
            system: Some(classifier_prompt(role)),
            messages: vec![Message::user(content)],
            model: self.model.clone(),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        };

        let reply = match timeout(self.timeout, self.provider.step(&request)).await {
            Ok(Ok(step)) => step.text().and_then(extract_json_object),
            Ok(Err(ProviderError::NotConfigured)) => None,
            Ok(Err(e)) => {
                warn!(role, error = %e, "intent classification failed");
                None
            }
            Err(_) => {
                warn!(role, timeout_ms = self.timeout.as_millis() as u64, "intent classification timed out");
                None
            }
        };

        let intent = match reply {
            Some(object) => interpret(&self.registry, role, &Value::Object(object), self.min_confidence),
            None => {
                debug!(role, "intent classification unavailable, using role defaults");
                Intent::fallback(&self.registry, role)
            }
        };
        info!(
            role,
            intent = %intent.class,
            confidence = intent.confidence,
            partitions = intent.partitions.len(),
            fallback = intent.fallback,
            latency_ms = started.elapsed().as_millis() as u64,
            "intent classified"
        );
        intent
    }
}
