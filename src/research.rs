//! Parallel research lookups with partial-failure tolerance.
//!
//! A research call fans out to one [`LookupSource`] per requested section.
//! Every section runs under its own deadline and settles independently:
//! a timeout or error becomes a status on that section, never a failed
//! call. Once every section has settled, a bounded synthesis step
//! summarizes the successful payloads. A failed synthesis is simply left
//! out of the report.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{ResearchConfig, SectionConfig};
use crate::error::RelayError;
use crate::provider::{GenerationProvider, GenerationRequest, Message, ProviderError};

const LOOKUP_SYSTEM_PROMPT: &str =
    "You are a research assistant. Reply with a single JSON object and nothing else.";

const SYNTHESIS_SYSTEM_PROMPT: &str = "You summarize research findings for a reader who needs a \
     quick decision. Use only the data provided. Be concise and concrete.";

/// The entity being researched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub id: String,
    pub display_name: String,
}

/// One external data source behind a research section.
#[async_trait]
pub trait LookupSource: Send + Sync {
    /// Section name this source answers.
    fn name(&self) -> &str;

    /// Fetch the section payload. `Ok(None)` means the source has nothing
    /// on this subject.
    async fn lookup(&self, subject: &Subject) -> Result<Option<Value>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Built-in sources
// ═══════════════════════════════════════════════════════════════════════

/// `GET` a URL template with `{subject_id}` substituted. 404 means not found.
pub struct HttpLookup {
    name: String,
    url_template: String,
    auth: Option<(String, String)>,
    client: reqwest::Client,
}

impl HttpLookup {
    pub fn new(
        name: impl Into<String>,
        url_template: impl Into<String>,
        auth: Option<(String, String)>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            name: name.into(),
            url_template: url_template.into(),
            auth,
            client,
        })
    }

    fn url_for(&self, subject: &Subject) -> String {
        self.url_template.replace("{subject_id}", &subject.id)
    }
}

#[async_trait]
impl LookupSource for HttpLookup {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, subject: &Subject) -> Result<Option<Value>> {
        let mut request = self.client.get(self.url_for(subject));
        if let Some((header, value)) = &self.auth {
            request = request.header(header.as_str(), value.as_str());
        }
        let response = request.send().await.context("lookup request failed")?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            bail!("lookup returned status {}", status.as_u16());
        }
        let body: Value = response.json().await.context("lookup returned invalid JSON")?;
        Ok(match body {
            Value::Null => None,
            Value::Object(ref m) if m.is_empty() => None,
            other => Some(other),
        })
    }
}

/// Ask the generation backend and parse a JSON object out of its reply.
pub struct PromptLookup {
    name: String,
    template: String,
    max_tokens: u32,
    provider: Arc<dyn GenerationProvider>,
}

impl PromptLookup {
    pub fn new(
        name: impl Into<String>,
        template: impl Into<String>,
        max_tokens: u32,
        provider: Arc<dyn GenerationProvider>,
    ) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            max_tokens,
            provider,
        }
    }

    fn prompt_for(&self, subject: &Subject) -> String {
        self.template
            .replace("{subject_id}", &subject.id)
            .replace("{display_name}", &subject.display_name)
    }
}

#[async_trait]
impl LookupSource for PromptLookup {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, subject: &Subject) -> Result<Option<Value>> {
        let request = GenerationRequest {
            system: Some(LOOKUP_SYSTEM_PROMPT.to_string()),
            messages: vec![Message::user(self.prompt_for(subject))],
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        };
        let step = self.provider.step(&request).await?;
        let Some(text) = step.text() else {
            bail!("expected a text reply, got a tool invocation");
        };
        let object = extract_json_object(text)
            .ok_or_else(|| anyhow::anyhow!("reply did not contain a JSON object"))?;
        Ok((!object.is_empty()).then_some(Value::Object(object)))
    }
}

/// Parse the JSON object in a model reply, tolerating surrounding prose
/// and markdown code fences.
pub fn extract_json_object(raw: &str) -> Option<Map<String, Value>> {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        text = rest.strip_prefix("json").unwrap_or(rest);
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

/// Build one source per configured section.
pub fn build_sources(
    config: &ResearchConfig,
    provider: Arc<dyn GenerationProvider>,
) -> Result<Vec<Arc<dyn LookupSource>>> {
    let request_timeout = Duration::from_secs(config.section_timeout_secs);
    let mut sources: Vec<Arc<dyn LookupSource>> = Vec::with_capacity(config.sections.len());

    for (name, section) in &config.sections {
        let source: Arc<dyn LookupSource> = match section {
            SectionConfig::Http {
                url,
                api_key_env,
                api_key_header,
            } => {
                let auth = match api_key_env {
                    Some(env) => {
                        let key = std::env::var(env).with_context(|| {
                            format!("{} environment variable not set (research section '{}')", env, name)
                        })?;
                        let value = if api_key_header.eq_ignore_ascii_case("authorization") {
                            format!("Bearer {}", key)
                        } else {
                            key
                        };
                        Some((api_key_header.clone(), value))
                    }
                    None => None,
                };
                Arc::new(HttpLookup::new(name, url, auth, request_timeout)?)
            }
            SectionConfig::Prompt { prompt, max_tokens } => Arc::new(PromptLookup::new(
                name,
                prompt,
                *max_tokens,
                provider.clone(),
            )),
        };
        sources.push(source);
    }
    Ok(sources)
}

// ═══════════════════════════════════════════════════════════════════════
// Request / report
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResearchRequest {
    pub subject_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub sections: Vec<String>,
    /// Caller-supplied payload for one section; that section skips its
    /// live lookup.
    #[serde(default)]
    pub prefetched: Option<PrefetchedSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrefetchedSection {
    pub section: String,
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionStatus {
    Success,
    Timeout,
    NotFound,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct SectionResult {
    pub section: String,
    pub status: SectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub latency_ms: u64,
}

impl SectionResult {
    fn new(section: &str, status: SectionStatus, started: Instant) -> Self {
        Self {
            section: section.to_string(),
            status,
            data: None,
            note: None,
            latency_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResearchReport {
    pub subject_id: String,
    pub display_name: String,
    /// One entry per requested section, in request order.
    pub sections: Vec<SectionResult>,
    /// Set when any section did not succeed.
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<String>,
    pub latency_ms: u64,
}

// ═══════════════════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════════════════

pub struct ResearchOrchestrator {
    sources: BTreeMap<String, Arc<dyn LookupSource>>,
    provider: Arc<dyn GenerationProvider>,
    section_timeout: Duration,
    synthesis_timeout: Duration,
    synthesis_max_tokens: u32,
}

impl ResearchOrchestrator {
    pub fn new(
        sources: Vec<Arc<dyn LookupSource>>,
        provider: Arc<dyn GenerationProvider>,
        config: &ResearchConfig,
    ) -> Self {
        Self {
            sources: sources
                .into_iter()
                .map(|s| (s.name().to_string(), s))
                .collect(),
            provider,
            section_timeout: Duration::from_secs(config.section_timeout_secs),
            synthesis_timeout: Duration::from_secs(config.synthesis_timeout_secs),
            synthesis_max_tokens: config.synthesis_max_tokens,
        }
    }

    /// Names of the sections this orchestrator can run.
    pub fn known_sections(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub async fn research(&self, req: &ResearchRequest) -> Result<ResearchReport, RelayError> {
        let started = Instant::now();

        let subject_id = req.subject_id.trim();
        if subject_id.is_empty() {
            return Err(RelayError::validation("subject_id must not be empty"));
        }
        if !is_url_safe(subject_id) {
            return Err(RelayError::validation(
                "subject_id may only contain letters, digits, '-', '_', '.', ':'",
            ));
        }
        let display_name = match req.display_name.trim() {
            "" => subject_id,
            name => name,
        };
        let subject = Subject {
            id: subject_id.to_string(),
            display_name: display_name.to_string(),
        };

        let mut sections: Vec<&str> = Vec::new();
        for name in req.sections.iter().map(|s| s.trim()) {
            if !self.sources.contains_key(name) {
                debug!(section = name, "ignoring unknown research section");
                continue;
            }
            if !sections.contains(&name) {
                sections.push(name);
            }
        }

        if let Some(pre) = &req.prefetched {
            let name = pre.section.trim();
            if !self.sources.contains_key(name) {
                return Err(RelayError::validation(format!(
                    "prefetched section '{}' is not a known section",
                    name
                )));
            }
            if !sections.contains(&name) {
                sections.push(name);
            }
        }

        if sections.is_empty() {
            return Err(RelayError::validation("no known research sections requested"));
        }

        let tasks = sections.iter().map(|name| {
            let prefetched = req
                .prefetched
                .as_ref()
                .filter(|p| p.section.trim() == *name)
                .map(|p| p.data.clone());
            self.run_section(name, &subject, prefetched)
        });
        let results = join_all(tasks).await;

        let partial = results.iter().any(|r| r.status != SectionStatus::Success);
        let synthesis = if results.iter().any(|r| r.status == SectionStatus::Success) {
            self.synthesize(&subject, &results).await
        } else {
            None
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        info!(
            subject = %subject.id,
            sections = results.len(),
            partial,
            synthesized = synthesis.is_some(),
            latency_ms,
            "research complete"
        );

        Ok(ResearchReport {
            subject_id: subject.id,
            display_name: subject.display_name,
            sections: results,
            partial,
            synthesis,
            latency_ms,
        })
    }

    async fn run_section(
        &self,
        name: &str,
        subject: &Subject,
        prefetched: Option<Value>,
    ) -> SectionResult {
        let started = Instant::now();

        if let Some(data) = prefetched {
            let mut result = SectionResult::new(name, SectionStatus::Success, started)
                .with_note("prefetched");
            result.data = Some(data);
            return result;
        }

        let Some(source) = self.sources.get(name) else {
            return SectionResult::new(name, SectionStatus::Error, started)
                .with_note("no source for section");
        };

        match timeout(self.section_timeout, source.lookup(subject)).await {
            Ok(Ok(Some(data))) => {
                let mut result = SectionResult::new(name, SectionStatus::Success, started);
                result.data = Some(data);
                result
            }
            Ok(Ok(None)) => SectionResult::new(name, SectionStatus::NotFound, started),
            Ok(Err(e)) => {
                warn!(section = name, subject = %subject.id, error = %e, "research section failed");
                SectionResult::new(name, SectionStatus::Error, started).with_note(e.to_string())
            }
            Err(_) => {
                warn!(
                    section = name,
                    subject = %subject.id,
                    timeout_secs = self.section_timeout.as_secs(),
                    "research section timed out"
                );
                SectionResult::new(name, SectionStatus::Timeout, started).with_note(format!(
                    "no response within {}s",
                    self.section_timeout.as_secs()
                ))
            }
        }
    }

    /// Summarize the successful sections. `None` when the backend fails,
    /// times out, or returns no text.
    async fn synthesize(&self, subject: &Subject, results: &[SectionResult]) -> Option<String> {
        let findings: Map<String, Value> = results
            .iter()
            .filter(|r| r.status == SectionStatus::Success)
            .filter_map(|r| r.data.clone().map(|d| (r.section.clone(), d)))
            .collect();

        let prompt = format!(
            "Subject: {} ({})\n\nFindings by section:\n{}\n\nWrite a short summary of what these findings say about the subject.",
            subject.display_name,
            subject.id,
            serde_json::to_string_pretty(&findings).unwrap_or_default()
        );
        let request = GenerationRequest {
            system: Some(SYNTHESIS_SYSTEM_PROMPT.to_string()),
            messages: vec![Message::user(prompt)],
            max_tokens: Some(self.synthesis_max_tokens),
            ..Default::default()
        };

        match timeout(self.synthesis_timeout, self.provider.step(&request)).await {
            Ok(Ok(step)) => step
                .text()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
            Ok(Err(ProviderError::NotConfigured)) => None,
            Ok(Err(e)) => {
                warn!(subject = %subject.id, error = %e, "research synthesis failed");
                None
            }
            Err(_) => {
                warn!(subject = %subject.id, "research synthesis timed out");
                None
            }
        }
    }
}

/// Subject ids are substituted into URL paths, so only a conservative
/// character set is accepted and dot segments are refused.
fn is_url_safe(id: &str) -> bool {
    !id.contains("..")
        && id.chars().any(|c| c != '.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}
