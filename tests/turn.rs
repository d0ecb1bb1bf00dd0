mod common;

use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use common::{finish, token, RecordingIndex, ScriptedProvider};
use knowledge_relay::config::Config;
use knowledge_relay::events::StreamEvent;
use knowledge_relay::provider::{Message, ProviderError, StopReason};
use knowledge_relay::retrieval::{IngestRequest, IngestStatus};
use knowledge_relay::server::Services;
use knowledge_relay::turn::{TurnRequest, TurnRetrieval};
use knowledge_relay_core::embedding::HashEmbedder;
use knowledge_relay_core::index::memory::InMemoryVectorIndex;

const PAY_NOTE: &str =
    "Acme Freight pays 58 cents per mile on dedicated Midwest lanes with weekly home time";

fn services(provider: Arc<ScriptedProvider>) -> Services {
    common::services(
        &Config::default(),
        Arc::new(HashEmbedder::new(128)),
        Arc::new(InMemoryVectorIndex::new()),
        provider,
        Vec::new(),
    )
}

fn services_with_index(config: &Config, provider: Arc<ScriptedProvider>, index: Arc<RecordingIndex>) -> Services {
    common::services(
        config,
        Arc::new(HashEmbedder::new(128)),
        index,
        provider,
        Vec::new(),
    )
}

async fn ingest_pay_note(svc: &Services) {
    let outcome = svc
        .retriever
        .ingest(&IngestRequest {
            partition: "carrier_intel".into(),
            document_id: "acme-pay".into(),
            text: PAY_NOTE.into(),
            role: "admin".into(),
            metadata: json!({"dot_number": "1234567", "chunk_type": "pay"})
                .as_object()
                .cloned()
                .unwrap_or_default(),
            source_updated_at: None,
        })
        .await
        .unwrap();
    assert_eq!(outcome.status, IngestStatus::Ingested);
}

fn ask_as(text: &str, role: &str) -> TurnRequest {
    TurnRequest {
        messages: vec![Message::user(text)],
        retrieval: Some(TurnRetrieval {
            role: role.into(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn ask(text: &str) -> TurnRequest {
    TurnRequest {
        messages: vec![Message::user(text)],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_invalid_turn_never_reaches_provider() {
    let provider = Arc::new(ScriptedProvider::new().with_text("unused"));
    let svc = services(provider.clone());

    let err = svc.turns.run(&TurnRequest::default()).await.unwrap_err();
    assert_eq!(err.code(), "validation_error");

    let mut req = ask("hi");
    req.max_tokens = Some(0);
    assert!(svc.turns.run(&req).await.is_err());
    assert!(svc.turns.start_stream(&req).await.is_err());

    assert!(provider.requests().is_empty());
}

#[tokio::test]
async fn test_buffered_turn_passes_through() {
    let provider = Arc::new(ScriptedProvider::new().with_text("Hello driver."));
    let svc = services(provider.clone());

    let mut req = ask("hello");
    req.system = Some("Be brief.".into());
    req.max_tokens = Some(256);
    let resp = svc.turns.run(&req).await.unwrap();

    assert_eq!(resp.step.text(), Some("Hello driver."));
    assert_eq!(resp.step.stop_reason, StopReason::EndTurn);
    assert!(resp.context.is_none());

    let sent = &provider.requests()[0];
    assert_eq!(sent.system.as_deref(), Some("Be brief."));
    assert_eq!(sent.max_tokens, Some(256));
}

#[tokio::test]
async fn test_retrieved_context_is_added_to_system_prompt() {
    let provider = Arc::new(ScriptedProvider::new().with_text("58 cents."));
    let svc = services(provider.clone());

    let outcome = svc
        .retriever
        .ingest(&IngestRequest {
            partition: "carrier_intel".into(),
            document_id: "acme-pay".into(),
            text: PAY_NOTE.into(),
            role: "admin".into(),
            metadata: json!({"dot_number": "1234567", "chunk_type": "pay"})
                .as_object()
                .cloned()
                .unwrap_or_default(),
            source_updated_at: None,
        })
        .await
        .unwrap();
    assert_eq!(outcome.status, IngestStatus::Ingested);

    let mut req = ask(PAY_NOTE);
    req.system = Some("Be brief.".into());
    req.retrieval = Some(TurnRetrieval {
        role: "driver".into(),
        partitions: vec!["carrier_intel".into()],
        ..Default::default()
    });
    let resp = svc.turns.run(&req).await.unwrap();

    let context = resp.context.unwrap();
    assert!(context.chunks >= 1);
    assert!(context.tokens > 0);
    assert_eq!(context.partitions, vec!["carrier_intel".to_string()]);

    let system = provider.requests()[0].system.clone().unwrap();
    assert!(system.starts_with("Be brief.\n\n<retrieved_context>"));
    assert!(system.contains(PAY_NOTE));
}

#[tokio::test]
async fn test_failed_retrieval_does_not_fail_the_turn() {
    let provider = Arc::new(ScriptedProvider::new().with_text("ok"));
    let svc = services(provider.clone());

    let mut req = ask("detention pay");
    req.system = Some("Be brief.".into());
    req.retrieval = Some(TurnRetrieval {
        role: String::new(),
        ..Default::default()
    });
    let resp = svc.turns.run(&req).await.unwrap();

    assert!(resp.context.is_none());
    assert_eq!(provider.requests()[0].system.as_deref(), Some("Be brief."));
}

#[tokio::test(start_paused = true)]
async fn test_buffered_turn_deadline() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_text("too late")
            .with_delay(Duration::from_secs(61)),
    );
    let svc = services(provider);

    let err = svc.turns.run(&ask("hello")).await.unwrap_err();
    assert_eq!(err.code(), "upstream_timeout");
}

#[tokio::test(start_paused = true)]
async fn test_streamed_turn_delivers_tokens_then_done() {
    let provider = Arc::new(ScriptedProvider::new().with_deltas(vec![
        token("Hel"),
        token("lo"),
        finish(),
    ]));
    let svc = services(provider);

    let start = svc.turns.start_stream(&ask("hello")).await.unwrap();
    assert_eq!(start.events_path, format!("/v1/stream/{}", start.token));

    let events: Vec<StreamEvent> = svc.sessions.subscribe(&start.token).collect().await;
    assert_eq!(events.len(), 3);
    assert_eq!(events[0], StreamEvent::Token { text: "Hel".into() });
    assert_eq!(events[1], StreamEvent::Token { text: "lo".into() });
    assert!(matches!(events[2], StreamEvent::Done { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_streamed_turn_without_finish_ends_in_error() {
    let provider = Arc::new(ScriptedProvider::new().with_deltas(vec![token("partial")]));
    let svc = services(provider);

    let start = svc.turns.start_stream(&ask("hello")).await.unwrap();
    let events: Vec<StreamEvent> = svc.sessions.subscribe(&start.token).collect().await;

    assert_eq!(events[0], StreamEvent::Token { text: "partial".into() });
    assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_streamed_turn_deadline_ends_in_error() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_deltas(vec![token("never"), finish()])
            .with_delay(Duration::from_secs(61)),
    );
    let svc = services(provider);

    let start = svc.turns.start_stream(&ask("hello")).await.unwrap();
    let events: Vec<StreamEvent> = svc.sessions.subscribe(&start.token).collect().await;

    assert!(events.iter().all(|e| !matches!(e, StreamEvent::Token { .. })));
    assert!(matches!(
        events.last(),
        Some(StreamEvent::Error { message }) if message.contains("deadline")
    ));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_covers_retrieval_and_generation() {
    let mut config = Config::default();
    config.turn.deadline_secs = 2;
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_text("late")
            .with_delay(Duration::from_millis(1500)),
    );
    let index = Arc::new(RecordingIndex::new().stalled("carrier_intel"));
    let svc = services_with_index(&config, provider.clone(), index);

    let mut req = ask("detention pay");
    req.retrieval = Some(TurnRetrieval {
        role: "driver".into(),
        partitions: vec!["carrier_intel".into()],
        ..Default::default()
    });

    let started = tokio::time::Instant::now();
    let err = svc.turns.run(&req).await.unwrap_err();
    assert_eq!(err.code(), "upstream_timeout");
    assert!(started.elapsed() <= Duration::from_secs(2));
    assert!(provider.requests().is_empty());

    let started = tokio::time::Instant::now();
    let err = svc.turns.start_stream(&req).await.unwrap_err();
    assert_eq!(err.code(), "upstream_timeout");
    assert!(started.elapsed() <= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_generation_gets_only_the_remaining_deadline() {
    // Retrieval gives up on the stalled partition after 5s, leaving 1s of
    // a 6s deadline for a 1.5s generation step.
    let mut config = Config::default();
    config.turn.deadline_secs = 6;
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_text("late")
            .with_delay(Duration::from_millis(1500)),
    );
    let index = Arc::new(RecordingIndex::new().stalled("carrier_intel"));
    let svc = services_with_index(&config, provider.clone(), index);

    let mut req = ask("detention pay");
    req.retrieval = Some(TurnRetrieval {
        role: "driver".into(),
        partitions: vec!["carrier_intel".into()],
        ..Default::default()
    });

    let started = tokio::time::Instant::now();
    let err = svc.turns.run(&req).await.unwrap_err();
    assert_eq!(err.code(), "upstream_timeout");
    assert!(started.elapsed() <= Duration::from_secs(6));
    assert_eq!(provider.requests().len(), 1);
}

#[tokio::test]
async fn test_classified_intent_scopes_retrieval() {
    let classification = r#"{"intentClass":"carrier_intel_request","confidence":0.93,
        "frameHint":"empathetic_informative",
        "entities":{"carriers":["Acme Freight"],"dot_numbers":["1234567"]}}"#;
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_text(classification)
            .with_text("58 cents."),
    );
    let index = Arc::new(RecordingIndex::new());
    let svc = services_with_index(&Config::default(), provider.clone(), index.clone());
    ingest_pay_note(&svc).await;

    let resp = svc.turns.run(&ask_as(PAY_NOTE, "driver")).await.unwrap();
    assert_eq!(resp.step.text(), Some("58 cents."));

    assert_eq!(index.queried_namespaces(), vec!["carrier_intel".to_string()]);
    assert_eq!(index.queries()[0].filter["dot_number"], "1234567");

    let context = resp.context.unwrap();
    assert!(context.chunks >= 1);
    let intent = context.intent.unwrap();
    assert_eq!(intent.class, "carrier_intel_request");
    assert!(!intent.fallback);

    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0]
        .system
        .as_deref()
        .is_some_and(|s| s.contains("intent classifier")));
    assert!(requests[1]
        .system
        .as_deref()
        .is_some_and(|s| s.contains(PAY_NOTE)));
}

#[tokio::test]
async fn test_low_confidence_intent_uses_role_defaults() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_text(r#"{"intentClass":"market_research","confidence":0.2}"#)
            .with_text("ok"),
    );
    let index = Arc::new(RecordingIndex::new());
    let svc = services_with_index(&Config::default(), provider, index.clone());

    let resp = svc.turns.run(&ask_as("anything new?", "carrier")).await.unwrap();

    let mut defaults = vec!["carrier_intel", "driver_market", "lane_market", "platform_ops"];
    defaults.sort();
    assert_eq!(index.queried_namespaces(), defaults);
    let intent = resp.context.unwrap().intent.unwrap();
    assert_eq!(intent.class, "general_inquiry");
    assert!(intent.fallback);
}

#[tokio::test]
async fn test_failed_classification_falls_back() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_step(Err(ProviderError::RateLimited))
            .with_text("ok"),
    );
    let index = Arc::new(RecordingIndex::new());
    let svc = services_with_index(&Config::default(), provider, index.clone());

    let resp = svc.turns.run(&ask_as("pay?", "admin")).await.unwrap();
    assert_eq!(resp.step.text(), Some("ok"));
    assert_eq!(index.queried_namespaces().len(), 4);
    assert!(resp.context.unwrap().intent.unwrap().fallback);
}

#[tokio::test]
async fn test_retrieval_free_intent_skips_the_index() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_text(r#"{"intentClass":"system_health","confidence":0.95}"#)
            .with_text("All green."),
    );
    let index = Arc::new(RecordingIndex::new());
    let svc = services_with_index(&Config::default(), provider, index.clone());

    let resp = svc.turns.run(&ask_as("is everything up?", "admin")).await.unwrap();
    assert!(index.queries().is_empty());
    let context = resp.context.unwrap();
    assert_eq!(context.chunks, 0);
    assert_eq!(context.intent.unwrap().class, "system_health");
}

#[tokio::test]
async fn test_disabled_classification_keeps_role_defaults() {
    let mut config = Config::default();
    config.intent.enabled = false;
    let provider = Arc::new(ScriptedProvider::new().with_text("ok"));
    let index = Arc::new(RecordingIndex::new());
    let svc = services_with_index(&config, provider.clone(), index.clone());

    let resp = svc.turns.run(&ask_as("pay?", "admin")).await.unwrap();
    assert_eq!(provider.requests().len(), 1);
    assert_eq!(index.queried_namespaces().len(), 4);
    assert!(resp.context.unwrap().intent.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_streamed_tool_call_reaches_the_client() {
    use knowledge_relay::provider::{StreamDelta, Usage};

    let provider = Arc::new(ScriptedProvider::new().with_deltas(vec![
        Ok(StreamDelta::ToolInvocation {
            call_id: "tu_1".into(),
            name: "lookup_carrier".into(),
            input: json!({"dot": "123"}),
        }),
        Ok(StreamDelta::Finish {
            stop_reason: StopReason::ToolUse,
            usage: Usage::default(),
        }),
    ]));
    let svc = services(provider);

    let start = svc.turns.start_stream(&ask("check carrier 123")).await.unwrap();
    let events: Vec<StreamEvent> = svc.sessions.subscribe(&start.token).collect().await;

    assert_eq!(events.len(), 2);
    assert_eq!(
        events[0],
        StreamEvent::ToolCall {
            call_id: "tu_1".into(),
            name: "lookup_carrier".into(),
            input: json!({"dot": "123"}),
        }
    );
    assert!(matches!(
        events[1],
        StreamEvent::Done {
            stop_reason: StopReason::ToolUse,
            ..
        }
    ));
}
