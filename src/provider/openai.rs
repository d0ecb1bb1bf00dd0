//! OpenAI Chat Completions backend.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::warn;

use super::sse::{frames, SseFrame};
use super::{
    api_key, DeltaStream, GenerationProvider, GenerationRequest, ProviderError, StepOutput,
    StepResult, StopReason, StreamDelta, Usage,
};
use crate::config::GenerationConfig;

const DEFAULT_URL: &str = "https://api.openai.com/v1/chat/completions";

pub struct OpenAiProvider {
    model: String,
    url: String,
    api_key: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("generation.model required for openai provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model,
            url: config.url.clone().unwrap_or_else(|| DEFAULT_URL.to_string()),
            api_key: api_key(config, "OPENAI_API_KEY")?,
            max_tokens: config.max_tokens,
            client,
        })
    }

    fn body(&self, request: &GenerationRequest, stream: bool) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = request.system.as_deref().filter(|s| !s.is_empty()) {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for m in &request.messages {
            messages.push(json!(m));
        }

        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
            "messages": messages,
        });
        if !request.tools.is_empty() {
            body["tools"] = json!(request
                .tools
                .iter()
                .map(|t| json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                }))
                .collect::<Vec<_>>());
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({ "include_usage": true });
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
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

fn finish_reason(raw: Option<&str>) -> StopReason {
    match raw {
        Some("stop") => StopReason::EndTurn,
        Some("length") => StopReason::MaxTokens,
        Some("tool_calls") | Some("function_call") => StopReason::ToolUse,
        _ => StopReason::Other,
    }
}

fn usage(v: &Value) -> Usage {
    Usage {
        input_tokens: v["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: v["completion_tokens"].as_u64().unwrap_or(0) as u32,
    }
}

/// Parse a buffered Chat Completions response. The first tool call, when
/// present, takes precedence over text.
pub(crate) fn parse_completion(json: &Value, latency_ms: u64) -> Result<StepResult, ProviderError> {
    let choice = json["choices"]
        .get(0)
        .ok_or_else(|| ProviderError::Malformed("missing choices".into()))?;
    let message = &choice["message"];

    let output = match message["tool_calls"].get(0) {
        Some(call) => {
            let args = call["function"]["arguments"].as_str().unwrap_or("{}");
            StepOutput::ToolInvocation {
                call_id: call["id"].as_str().unwrap_or_default().to_string(),
                name: call["function"]["name"]
                    .as_str()
                    .ok_or_else(|| ProviderError::Malformed("tool call without name".into()))?
                    .to_string(),
                input: serde_json::from_str(args)
                    .map_err(|e| ProviderError::Malformed(format!("tool arguments: {}", e)))?,
            }
        }
        None => StepOutput::Text {
            text: message["content"].as_str().unwrap_or_default().to_string(),
        },
    };

    Ok(StepResult {
        output,
        stop_reason: finish_reason(choice["finish_reason"].as_str()),
        usage: usage(&json["usage"]),
        run_id: json["id"].as_str().unwrap_or_default().to_string(),
        latency_ms,
    })
}

#[async_trait]
impl GenerationProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn step(&self, request: &GenerationRequest) -> Result<StepResult, ProviderError> {
        let started = Instant::now();
        let response = self.send(&self.body(request, false)).await?;
        let json: Value = response.json().await?;
        parse_completion(&json, started.elapsed().as_millis() as u64)
    }

    async fn deltas(&self, request: &GenerationRequest) -> Result<DeltaStream, ProviderError> {
        let response = self.send(&self.body(request, true)).await?;
        Ok(completion_deltas(frames(response)))
    }
}

/// Tool call fragments accumulated by `index`.
#[derive(Default)]
struct PartialCall {
    call_id: String,
    name: String,
    arguments: String,
}

fn finish_call(call: PartialCall) -> Result<StreamDelta, ProviderError> {
    if call.name.is_empty() {
        return Err(ProviderError::Malformed("tool call without name".into()));
    }
    let args = if call.arguments.trim().is_empty() { "{}" } else { call.arguments.as_str() };
    Ok(StreamDelta::ToolInvocation {
        call_id: call.call_id,
        name: call.name,
        input: serde_json::from_str(args)
            .map_err(|e| ProviderError::Malformed(format!("tool arguments: {}", e)))?,
    })
}

/// Turn Chat Completions stream frames into deltas. Tool calls arrive in
/// fragments under `delta.tool_calls` and are emitted whole, in index
/// order, just before the finish.
pub(crate) fn completion_deltas(mut sse: BoxStream<'static, Result<SseFrame, ProviderError>>) -> DeltaStream {
    let stream = async_stream::try_stream! {
        let mut usage_total = Usage::default();
        let mut reason: Option<StopReason> = None;
        let mut calls: BTreeMap<u64, PartialCall> = BTreeMap::new();

        while let Some(frame) = sse.next().await {
            let frame = frame?;
            if frame.data == "[DONE]" {
                break;
            }
            if frame.data.is_empty() {
                continue;
            }
            let data: Value = serde_json::from_str(&frame.data)
                .map_err(|e| ProviderError::Malformed(e.to_string()))?;

            if let Some(message) = data["error"]["message"].as_str() {
                warn!(backend_message = message, "openai stream error");
                Err(ProviderError::Unavailable("stream interrupted by backend".into()))?;
            }
            if data["usage"].is_object() {
                usage_total = usage(&data["usage"]);
            }
            if let Some(choice) = data["choices"].get(0) {
                let delta = &choice["delta"];
                if let Some(text) = delta["content"].as_str() {
                    yield StreamDelta::Text(text.to_string());
                }
                for fragment in delta["tool_calls"].as_array().into_iter().flatten() {
                    let call = calls.entry(fragment["index"].as_u64().unwrap_or(0)).or_default();
                    if let Some(id) = fragment["id"].as_str() {
                        call.call_id = id.to_string();
                    }
                    if let Some(name) = fragment["function"]["name"].as_str() {
                        call.name.push_str(name);
                    }
                    if let Some(args) = fragment["function"]["arguments"].as_str() {
                        call.arguments.push_str(args);
                    }
                }
                if let Some(raw) = choice["finish_reason"].as_str() {
                    reason = Some(finish_reason(Some(raw)));
                }
            }
        }

        // Without a finish reason the stream was cut off; let the caller
        // report it.
        if let Some(stop_reason) = reason {
            for (_, call) in std::mem::take(&mut calls) {
                yield finish_call(call)?;
            }
            yield StreamDelta::Finish { stop_reason, usage: usage_total };
        }
    };
    stream.boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Message;

    fn provider() -> OpenAiProvider {
        OpenAiProvider {
            model: "model-b".into(),
            url: DEFAULT_URL.into(),
            api_key: "k".into(),
            max_tokens: 128,
            client: reqwest::Client::new(),
        }
    }

    #[test]
    fn test_system_prompt_becomes_first_message() {
        let req = GenerationRequest {
            system: Some("sys".into()),
            messages: vec![Message::user("hi")],
            ..Default::default()
        };
        let body = provider().body(&req, false);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["max_tokens"], 128);
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn test_parse_text_completion() {
        let json = json!({
            "id": "chatcmpl-1",
            "choices": [{"message": {"role": "assistant", "content": "Sure."}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 9, "completion_tokens": 2}
        });
        let step = parse_completion(&json, 3).unwrap();
        assert_eq!(step.text(), Some("Sure."));
        assert_eq!(step.stop_reason, StopReason::EndTurn);
        assert_eq!(step.usage.input_tokens, 9);
    }

    #[test]
    fn test_parse_tool_call() {
        let json = json!({
            "id": "chatcmpl-2",
            "choices": [{
                "message": {"tool_calls": [{
                    "id": "call_1",
                    "function": {"name": "lookup", "arguments": "{\"dot\":\"42\"}"}
                }]},
                "finish_reason": "tool_calls"
            }]
        });
        let step = parse_completion(&json, 0).unwrap();
        assert_eq!(step.stop_reason, StopReason::ToolUse);
        assert!(matches!(
            step.output,
            StepOutput::ToolInvocation { ref name, ref input, .. } if name == "lookup" && input["dot"] == "42"
        ));
    }

    #[test]
    fn test_parse_bad_arguments() {
        let json = json!({
            "choices": [{"message": {"tool_calls": [{
                "id": "c", "function": {"name": "x", "arguments": "{not json"}
            }]}}]
        });
        assert!(matches!(
            parse_completion(&json, 0),
            Err(ProviderError::Malformed(_))
        ));
    }

    fn frame(data: Value) -> Result<SseFrame, ProviderError> {
        Ok(SseFrame {
            event: String::new(),
            data: data.to_string(),
        })
    }

    fn done() -> Result<SseFrame, ProviderError> {
        Ok(SseFrame {
            event: String::new(),
            data: "[DONE]".into(),
        })
    }

    #[tokio::test]
    async fn test_stream_assembles_tool_call_fragments() {
        let deltas: Vec<_> = completion_deltas(
            futures::stream::iter(vec![
                frame(json!({"choices": [{"delta": {"tool_calls": [{
                    "index": 0, "id": "call_1", "type": "function",
                    "function": {"name": "lookup", "arguments": ""}
                }]}}]})),
                frame(json!({"choices": [{"delta": {"tool_calls": [{
                    "index": 0, "function": {"arguments": "{\"dot\":"}
                }]}}]})),
                frame(json!({"choices": [{"delta": {"tool_calls": [{
                    "index": 0, "function": {"arguments": "\"42\"}"}
                }]}}]})),
                frame(json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]})),
                frame(json!({"choices": [], "usage": {"prompt_tokens": 3, "completion_tokens": 7}})),
                done(),
            ])
            .boxed(),
        )
        .collect()
        .await;

        assert_eq!(deltas.len(), 2);
        assert_eq!(
            deltas[0],
            Ok(StreamDelta::ToolInvocation {
                call_id: "call_1".into(),
                name: "lookup".into(),
                input: json!({"dot": "42"}),
            })
        );
        assert_eq!(
            deltas[1],
            Ok(StreamDelta::Finish {
                stop_reason: StopReason::ToolUse,
                usage: Usage {
                    input_tokens: 3,
                    output_tokens: 7
                },
            })
        );
    }

    #[tokio::test]
    async fn test_stream_without_finish_yields_no_finish() {
        let deltas: Vec<_> = completion_deltas(
            futures::stream::iter(vec![
                frame(json!({"choices": [{"delta": {"content": "Hel"}}]})),
                done(),
            ])
            .boxed(),
        )
        .collect()
        .await;
        assert_eq!(deltas, vec![Ok(StreamDelta::Text("Hel".into()))]);
    }
}
