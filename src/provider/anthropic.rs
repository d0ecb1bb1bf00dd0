//! Anthropic Messages API backend.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::warn;

use super::sse::{frames, SseFrame};
use super::{
    api_key, DeltaStream, GenerationProvider, GenerationRequest, ProviderError, StepOutput,
    StepResult, StopReason, StreamDelta, Usage,
};
use crate::config::GenerationConfig;

const DEFAULT_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    model: String,
    url: String,
    api_key: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("generation.model required for anthropic provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model,
            url: config.url.clone().unwrap_or_else(|| DEFAULT_URL.to_string()),
            api_key: api_key(config, "ANTHROPIC_API_KEY")?,
            max_tokens: config.max_tokens,
            client,
        })
    }

    fn body(&self, request: &GenerationRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
            "messages": request.messages,
        });
        if let Some(system) = request.system.as_deref().filter(|s| !s.is_empty()) {
            body["system"] = json!(system);
        }
        if !request.tools.is_empty() {
            body["tools"] = json!(request
                .tools
                .iter()
                .map(|t| json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                }))
                .collect::<Vec<_>>());
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, text));
        }
        Ok(response)
    }
}

fn stop_reason(raw: Option<&str>) -> StopReason {
    match raw {
        Some("end_turn") => StopReason::EndTurn,
        Some("max_tokens") => StopReason::MaxTokens,
        Some("tool_use") => StopReason::ToolUse,
        Some("stop_sequence") => StopReason::StopSequence,
        _ => StopReason::Other,
    }
}

fn usage(v: &Value) -> Usage {
    Usage {
        input_tokens: v["input_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: v["output_tokens"].as_u64().unwrap_or(0) as u32,
    }
}

/// Parse a buffered Messages API response. A `tool_use` block takes
/// precedence over text.
pub(crate) fn parse_message(json: &Value, latency_ms: u64) -> Result<StepResult, ProviderError> {
    let blocks = json["content"]
        .as_array()
        .ok_or_else(|| ProviderError::Malformed("missing content".into()))?;

    let tool = blocks.iter().find(|b| b["type"] == "tool_use");
    let output = match tool {
        Some(b) => StepOutput::ToolInvocation {
            call_id: b["id"].as_str().unwrap_or_default().to_string(),
            name: b["name"]
                .as_str()
                .ok_or_else(|| ProviderError::Malformed("tool call without name".into()))?
                .to_string(),
            input: b.get("input").cloned().unwrap_or_else(|| json!({})),
        },
        None => StepOutput::Text {
            text: blocks
                .iter()
                .filter(|b| b["type"] == "text")
                .filter_map(|b| b["text"].as_str())
                .collect::<Vec<_>>()
                .join(""),
        },
    };

    Ok(StepResult {
        output,
        stop_reason: stop_reason(json["stop_reason"].as_str()),
        usage: usage(&json["usage"]),
        run_id: json["id"].as_str().unwrap_or_default().to_string(),
        latency_ms,
    })
}

#[async_trait]
impl GenerationProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn step(&self, request: &GenerationRequest) -> Result<StepResult, ProviderError> {
        let started = Instant::now();
        let response = self.send(&self.body(request, false)).await?;
        let json: Value = response.json().await?;
        parse_message(&json, started.elapsed().as_millis() as u64)
    }

    async fn deltas(&self, request: &GenerationRequest) -> Result<DeltaStream, ProviderError> {
        let response = self.send(&self.body(request, true)).await?;
        Ok(message_deltas(frames(response)))
    }
}

/// A `tool_use` content block whose input is still arriving.
struct PendingTool {
    call_id: String,
    name: String,
    input_json: String,
}

impl PendingTool {
    fn finish(self) -> Result<StreamDelta, ProviderError> {
        let input = if self.input_json.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&self.input_json)
                .map_err(|e| ProviderError::Malformed(format!("tool input: {}", e)))?
        };
        Ok(StreamDelta::ToolInvocation {
            call_id: self.call_id,
            name: self.name,
            input,
        })
    }
}

/// Turn Messages API stream frames into deltas. Tool input arrives as
/// `input_json_delta` fragments and is emitted once its block stops.
pub(crate) fn message_deltas(mut sse: BoxStream<'static, Result<SseFrame, ProviderError>>) -> DeltaStream {
    let stream = async_stream::try_stream! {
        let mut usage_total = Usage::default();
        let mut reason = StopReason::Other;
        let mut tool: Option<PendingTool> = None;

        while let Some(frame) = sse.next().await {
            let frame = frame?;
            if frame.data.is_empty() {
                continue;
            }
            let data: Value = serde_json::from_str(&frame.data)
                .map_err(|e| ProviderError::Malformed(e.to_string()))?;

            match data["type"].as_str().unwrap_or(frame.event.as_str()) {
                "message_start" => {
                    usage_total.input_tokens = usage(&data["message"]["usage"]).input_tokens;
                }
                "content_block_start" => {
                    let block = &data["content_block"];
                    if block["type"] == "tool_use" {
                        let name = block["name"]
                            .as_str()
                            .ok_or_else(|| ProviderError::Malformed("tool call without name".into()))?;
                        tool = Some(PendingTool {
                            call_id: block["id"].as_str().unwrap_or_default().to_string(),
                            name: name.to_string(),
                            input_json: String::new(),
                        });
                    }
                }
                "content_block_delta" => {
                    let delta = &data["delta"];
                    match delta["type"].as_str() {
                        Some("input_json_delta") => {
                            if let (Some(t), Some(part)) = (tool.as_mut(), delta["partial_json"].as_str()) {
                                t.input_json.push_str(part);
                            }
                        }
                        _ => {
                            if let Some(text) = delta["text"].as_str() {
                                yield StreamDelta::Text(text.to_string());
                            }
                        }
                    }
                }
                "content_block_stop" => {
                    if let Some(t) = tool.take() {
                        yield t.finish()?;
                    }
                }
                "message_delta" => {
                    reason = stop_reason(data["delta"]["stop_reason"].as_str());
                    usage_total.output_tokens = usage(&data["usage"]).output_tokens;
                }
                "message_stop" => {
                    yield StreamDelta::Finish { stop_reason: reason, usage: usage_total };
                    break;
                }
                "error" => {
                    let message = data["error"]["message"].as_str().unwrap_or("stream error");
                    warn!(backend_message = message, "anthropic stream error");
                    Err(ProviderError::Unavailable("stream interrupted by backend".into()))?;
                }
                _ => {}
            }
        }
    };
    stream.boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Message, ToolDefinition};

    fn provider() -> AnthropicProvider {
        AnthropicProvider {
            model: "model-a".into(),
            url: DEFAULT_URL.into(),
            api_key: "k".into(),
            max_tokens: 256,
            client: reqwest::Client::new(),
        }
    }

    #[test]
    fn test_body_shape() {
        let req = GenerationRequest {
            system: Some("be brief".into()),
            messages: vec![Message::user("hi")],
            tools: vec![ToolDefinition {
                name: "lookup".into(),
                description: "find a carrier".into(),
                input_schema: json!({"type": "object"}),
            }],
            model: None,
            max_tokens: Some(64),
        };
        let body = provider().body(&req, true);
        assert_eq!(body["model"], "model-a");
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn test_parse_text_message() {
        let json = json!({
            "id": "msg_1",
            "content": [{"type": "text", "text": "Hello"}, {"type": "text", "text": " there"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 2}
        });
        let step = parse_message(&json, 5).unwrap();
        assert_eq!(step.text(), Some("Hello there"));
        assert_eq!(step.stop_reason, StopReason::EndTurn);
        assert_eq!(step.usage.output_tokens, 2);
        assert_eq!(step.run_id, "msg_1");
    }

    #[test]
    fn test_parse_tool_use() {
        let json = json!({
            "id": "msg_2",
            "content": [
                {"type": "text", "text": "Checking."},
                {"type": "tool_use", "id": "tu_1", "name": "lookup", "input": {"dot": "123"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        });
        let step = parse_message(&json, 0).unwrap();
        match step.output {
            StepOutput::ToolInvocation { call_id, name, input } => {
                assert_eq!(call_id, "tu_1");
                assert_eq!(name, "lookup");
                assert_eq!(input["dot"], "123");
            }
            other => panic!("expected tool invocation, got {:?}", other),
        }
    }

    fn frame(event: &str, data: Value) -> Result<SseFrame, ProviderError> {
        Ok(SseFrame {
            event: event.into(),
            data: data.to_string(),
        })
    }

    async fn collect(frames: Vec<Result<SseFrame, ProviderError>>) -> Vec<Result<StreamDelta, ProviderError>> {
        message_deltas(futures::stream::iter(frames).boxed())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_stream_assembles_tool_input() {
        let deltas = collect(vec![
            frame("message_start", json!({"type": "message_start", "message": {"usage": {"input_tokens": 5}}})),
            frame("content_block_start", json!({
                "type": "content_block_start", "index": 0,
                "content_block": {"type": "tool_use", "id": "tu_1", "name": "lookup", "input": {}}
            })),
            frame("content_block_delta", json!({
                "type": "content_block_delta", "index": 0,
                "delta": {"type": "input_json_delta", "partial_json": "{\"dot\":"}
            })),
            frame("content_block_delta", json!({
                "type": "content_block_delta", "index": 0,
                "delta": {"type": "input_json_delta", "partial_json": "\"123\"}"}
            })),
            frame("content_block_stop", json!({"type": "content_block_stop", "index": 0})),
            frame("message_delta", json!({
                "type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 9}
            })),
            frame("message_stop", json!({"type": "message_stop"})),
        ])
        .await;

        assert_eq!(deltas.len(), 2);
        assert_eq!(
            deltas[0],
            Ok(StreamDelta::ToolInvocation {
                call_id: "tu_1".into(),
                name: "lookup".into(),
                input: json!({"dot": "123"}),
            })
        );
        assert_eq!(
            deltas[1],
            Ok(StreamDelta::Finish {
                stop_reason: StopReason::ToolUse,
                usage: Usage {
                    input_tokens: 5,
                    output_tokens: 9
                },
            })
        );
    }

    #[tokio::test]
    async fn test_stream_text_and_error_frames() {
        let deltas = collect(vec![
            frame("content_block_start", json!({"type": "content_block_start", "content_block": {"type": "text", "text": ""}})),
            frame("content_block_delta", json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "Hi"}})),
            frame("content_block_stop", json!({"type": "content_block_stop"})),
            frame("error", json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}})),
        ])
        .await;
        assert_eq!(deltas[0], Ok(StreamDelta::Text("Hi".into())));
        match &deltas[1] {
            Err(e) => assert!(!e.to_string().contains("Overloaded")),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_missing_content() {
        assert!(matches!(
            parse_message(&json!({"id": "x"}), 0),
            Err(ProviderError::Malformed(_))
        ));
    }
}
