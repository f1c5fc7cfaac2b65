//! AI-assisted rule synthesis: digest current telemetry, ask a
//! chat-completion service for one drop rule, and validate the
//! answer before it is handed back.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec;
use crate::digest;
use crate::error::{SynthesisError, TelemetryError};
use crate::metrics::{Metrics, SynthesisOutcome};
use crate::rule::{Action, FilterRule, RuleSpec};
use crate::telemetry::{DigestScope, TelemetryReader, TelemetrySnapshot};

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const MAX_COMPLETION_TOKENS: u32 = 2000;

/// Placeholder returned instead of a configured api key.
pub const REDACTED_KEY: &str = "********";

// ── Configuration ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    #[serde(alias = "openai_endpoint")]
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f64,
    #[serde(alias = "timeout")]
    pub timeout_secs: u64,
    /// Log prompts, digests and raw responses at info level.
    pub debug: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            debug: false,
        }
    }
}

impl GenerationConfig {
    /// Replace blank or zero fields with the defaults. The api key has no
    /// default.
    pub fn with_defaults(mut self) -> Self {
        if self.endpoint.trim().is_empty() {
            self.endpoint = DEFAULT_ENDPOINT.to_string();
        }
        if self.model.trim().is_empty() {
            self.model = DEFAULT_MODEL.to_string();
        }
        if self.temperature <= 0.0 {
            self.temperature = DEFAULT_TEMPERATURE;
        }
        if self.timeout_secs == 0 {
            self.timeout_secs = DEFAULT_TIMEOUT_SECS;
        }
        self
    }

    pub fn status(&self) -> ConfigStatus {
        let has_api_key = !self.api_key.trim().is_empty();
        let has_endpoint = !self.endpoint.trim().is_empty();
        let has_model = !self.model.trim().is_empty();
        ConfigStatus {
            is_configured: has_api_key && has_endpoint && has_model,
            has_api_key,
            has_endpoint,
            has_model,
        }
    }

    /// Copy safe to return over the API.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.api_key.is_empty() {
            copy.api_key = REDACTED_KEY.to_string();
        }
        copy
    }

    fn missing_fields(&self) -> Vec<&'static str> {
        let status = self.status();
        let mut missing = Vec::new();
        if !status.has_endpoint {
            missing.push("endpoint");
        }
        if !status.has_api_key {
            missing.push("api_key");
        }
        if !status.has_model {
            missing.push("model");
        }
        missing
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConfigStatus {
    pub is_configured: bool,
    pub has_api_key: bool,
    pub has_endpoint: bool,
    pub has_model: bool,
}

// ── Requests and responses ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisMode {
    Security,
    Performance,
    Balanced,
}

impl AnalysisMode {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "security" => AnalysisMode::Security,
            "performance" => AnalysisMode::Performance,
            _ => AnalysisMode::Balanced,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisRequest {
    /// "security", "performance", or anything else for a balanced review.
    pub analyze_type: String,
    pub include_icmp: bool,
    pub include_tcp: bool,
    pub include_stats: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub custom_prompt: String,
}

impl AnalysisRequest {
    /// An empty mode means security; no selected tables means all of them.
    pub fn normalized(mut self) -> Self {
        if self.analyze_type.trim().is_empty() {
            self.analyze_type = "security".to_string();
        }
        if !self.include_icmp && !self.include_tcp && !self.include_stats {
            self.include_icmp = true;
            self.include_tcp = true;
            self.include_stats = true;
        }
        self
    }

    pub fn mode(&self) -> AnalysisMode {
        AnalysisMode::from_name(&self.analyze_type)
    }

    pub fn scope(&self) -> DigestScope {
        DigestScope {
            connections: self.include_tcp,
            icmp: self.include_icmp,
            stats: self.include_stats,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    Telemetry,
    ContentParse,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A rule the service proposed that did not survive validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscardedProposal {
    pub proposal: serde_json::Value,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisResponse {
    pub success: bool,
    /// Zero or one validated drop rule.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterRule>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub analysis: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    pub tokens_used: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub discarded: Vec<DiscardedProposal>,
}

impl AnalysisResponse {
    fn failed(kind: FailureKind, error: String) -> Self {
        Self {
            success: false,
            error: Some(error),
            failure: Some(kind),
            ..Default::default()
        }
    }
}

// ── Generation service wire types ────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f64,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: TokenUsage,
    #[serde(default)]
    error: Option<ServiceError>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ServiceError {
    #[serde(default)]
    message: String,
}

/// The JSON document the role prompt asks for.
#[derive(Default, Deserialize)]
#[serde(default)]
struct GeneratedContent {
    analysis: String,
    suggestions: Vec<String>,
    filters: Vec<serde_json::Value>,
}

// ── Synthesizer ──────────────────────────────────────────────────────

/// One immutable configuration snapshot and the HTTP client built for it.
struct Generator {
    config: GenerationConfig,
    client: reqwest::Client,
}

impl Generator {
    fn new(config: GenerationConfig) -> Result<Self, SynthesisError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SynthesisError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    async fn complete(
        &self,
        system_prompt: &str,
        digest: &str,
    ) -> Result<(String, TokenUsage), SynthesisError> {
        let user_prompt = format!(
            "Analyze the following network connection data and generate appropriate filter rules. \
             Remember to respond ONLY with valid JSON:\n\n{digest}"
        );
        let body = ChatRequest {
            model: &self.config.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &user_prompt,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: MAX_COMPLETION_TOKENS,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        self.trace(
            "request",
            &format!(
                "POST {} model={} temperature={} timeout={}s",
                self.config.endpoint, self.config.model, self.config.temperature,
                self.config.timeout_secs
            ),
        );

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SynthesisError::Transport(format!("request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| SynthesisError::Transport(format!("failed to read response body: {e}")))?;
        self.trace("response", &format!("status={status} body={text}"));

        if !status.is_success() {
            return Err(SynthesisError::Transport(format!(
                "service returned {status}: {}",
                clip(&text, 512)
            )));
        }

        let completion: ChatCompletion = serde_json::from_str(&text)
            .map_err(|e| SynthesisError::Transport(format!("undecodable response envelope: {e}")))?;
        if let Some(err) = completion.error {
            return Err(SynthesisError::Transport(format!(
                "service error: {}",
                err.message
            )));
        }
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| SynthesisError::Transport("response contained no choices".to_string()))?;

        Ok((choice.message.content.unwrap_or_default(), completion.usage))
    }

    fn trace(&self, stage: &'static str, detail: &str) {
        if self.config.debug {
            info!(stage, "{detail}");
        } else {
            debug!(stage, "{detail}");
        }
    }
}

/// Runs analyses against the current [`GenerationConfig`].
///
/// The configuration can be swapped at any time; a call in flight keeps
/// the snapshot it started with.
pub struct Synthesizer {
    current: ArcSwap<Generator>,
    metrics: Arc<Metrics>,
}

impl Synthesizer {
    pub fn new(config: GenerationConfig, metrics: Arc<Metrics>) -> Result<Self, SynthesisError> {
        let generator = Generator::new(config.with_defaults())?;
        Ok(Self {
            current: ArcSwap::from_pointee(generator),
            metrics,
        })
    }

    pub fn config(&self) -> GenerationConfig {
        self.current.load().config.clone()
    }

    /// Install a new configuration, filling defaults. Returns what was
    /// installed.
    pub fn replace_config(&self, config: GenerationConfig) -> Result<GenerationConfig, SynthesisError> {
        let generator = Generator::new(config.with_defaults())?;
        let installed = generator.config.clone();
        self.current.store(Arc::new(generator));

        info!(
            endpoint = %installed.endpoint,
            model = %installed.model,
            timeout_secs = installed.timeout_secs,
            configured = installed.status().is_configured,
            "generation config updated"
        );
        Ok(installed)
    }

    pub fn status(&self) -> ConfigStatus {
        self.current.load().config.status()
    }

    /// Build the digest a synthesis call would send, without calling out.
    pub fn digest(
        &self,
        reader: &dyn TelemetryReader,
        request: &AnalysisRequest,
    ) -> Result<String, TelemetryError> {
        let request = request.clone().normalized();
        let snapshot = TelemetrySnapshot::capture(reader, request.scope())?;
        Ok(digest::summarize(&snapshot, request.scope()))
    }

    /// Ask the generation service for one drop rule.
    ///
    /// Configuration, telemetry and content problems come back as
    /// `Ok` with `success == false` and a [`FailureKind`]; only transport
    /// failures are `Err`.
    pub async fn synthesize(
        &self,
        reader: &dyn TelemetryReader,
        request: &AnalysisRequest,
    ) -> Result<AnalysisResponse, SynthesisError> {
        let generator = self.current.load_full();
        let request = request.clone().normalized();

        let missing = generator.config.missing_fields();
        if !missing.is_empty() {
            self.metrics.record_synthesis(SynthesisOutcome::Configuration);
            return Ok(AnalysisResponse::failed(
                FailureKind::Configuration,
                format!("Configuration validation failed: missing {}", missing.join(", ")),
            ));
        }

        let digest = match self.digest(reader, &request) {
            Ok(digest) => digest,
            Err(e) => {
                self.metrics.record_synthesis(SynthesisOutcome::Telemetry);
                return Ok(AnalysisResponse::failed(
                    FailureKind::Telemetry,
                    format!("Failed to generate connection summary: {e}"),
                ));
            }
        };
        generator.trace("digest", &digest);

        let prompt = system_prompt(request.mode(), &request.custom_prompt);
        generator.trace("prompt", &prompt);

        let (content, usage) = match generator.complete(&prompt, &digest).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("rule synthesis failed: {e}");
                self.metrics.record_synthesis(SynthesisOutcome::Transport);
                return Err(e);
            }
        };
        self.metrics.synthesis_tokens.inc_by(u64::from(usage.total_tokens));

        let response = interpret(&content, usage);
        generator.trace("result", &format!("{response:?}"));
        self.metrics.record_synthesis(if response.success {
            SynthesisOutcome::Success
        } else {
            SynthesisOutcome::ContentParse
        });

        info!(
            mode = ?request.mode(),
            proposed = response.filters.len(),
            discarded = response.discarded.len(),
            tokens = usage.total_tokens,
            "rule synthesis complete"
        );
        Ok(response)
    }
}

/// Turn the service's message content into a response, validating every
/// proposed rule.
fn interpret(content: &str, usage: TokenUsage) -> AnalysisResponse {
    let parsed: GeneratedContent = match serde_json::from_str(strip_fences(content)) {
        Ok(parsed) => parsed,
        Err(e) => {
            let mut response = AnalysisResponse::failed(
                FailureKind::ContentParse,
                format!("Failed to parse AI response as JSON: {e}\nRaw response: {content}"),
            );
            response.tokens_used = usage.total_tokens;
            response.usage = Some(usage);
            return response;
        }
    };

    let mut response = AnalysisResponse {
        success: true,
        analysis: parsed.analysis,
        suggestions: parsed.suggestions,
        tokens_used: usage.total_tokens,
        usage: Some(usage),
        ..Default::default()
    };

    for proposal in parsed.filters {
        match validate_proposal(&proposal) {
            Ok(rule) if response.filters.is_empty() => response.filters.push(rule),
            Ok(_) => response.discarded.push(DiscardedProposal {
                proposal,
                reason: "only one rule is accepted per analysis".to_string(),
            }),
            Err(reason) => response.discarded.push(DiscardedProposal { proposal, reason }),
        }
    }

    response
}

fn validate_proposal(proposal: &serde_json::Value) -> Result<FilterRule, String> {
    let spec: RuleSpec = serde_json::from_value(proposal.clone())
        .map_err(|e| format!("malformed rule: {e}"))?;
    let rule = codec::parse(&spec.normalized()).map_err(|e| e.to_string())?;
    if rule.action != Action::Drop {
        return Err(format!(
            "proposed rules must drop traffic, got action {}",
            rule.action.as_str()
        ));
    }
    Ok(rule)
}

/// Remove a surrounding Markdown code fence and its language tag
/// (`json`, `JSON`, ...), if any.
pub fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let body = match trimmed.strip_prefix("```") {
        Some(rest) => {
            let tag_len = rest
                .find(|c: char| !c.is_ascii_alphanumeric())
                .unwrap_or(rest.len());
            &rest[tag_len..]
        }
        None => trimmed,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}

fn clip(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ── Prompts ──────────────────────────────────────────────────────────

const BASE_PROMPT: &str = r#"You are a network security expert specializing in eBPF/XDP packet filtering. Your task is to analyze network connection data and identify the most critical security threat, then generate ONE primary defensive filter rule to block suspicious traffic.

CRITICAL: You MUST respond with ONLY a valid JSON object. Do not include any explanatory text, markdown formatting, or code blocks. Your entire response must be parseable as JSON.

Filter Rule Types:
1. "basic" - IP address, port, and protocol filtering
2. "tcp" - TCP-specific filtering with flags
3. "udp" - UDP-specific filtering
4. "icmp" - ICMP-specific filtering with types and codes

Primary Action: "drop" - Block suspicious/malicious traffic

Required JSON Output Format:
{
  "analysis": "Brief analysis of the most critical security threat identified",
  "suggestions": ["Key security recommendations"],
  "filters": [
    {
      "rule_type": "basic|tcp|udp|icmp",
      "src_ip": "specific IP or empty for any",
      "dst_ip": "specific IP or empty for any",
      "src_port": port_number_or_0_for_any,
      "dst_port": port_number_or_0_for_any,
      "protocol": "tcp|udp|icmp|any",
      "action": "drop",
      "enabled": true,
      "comment": "Description of why this suspicious traffic should be blocked",
      "tcp_flags": tcp_flag_value_if_applicable,
      "tcp_flags_mask": tcp_flag_mask_if_applicable,
      "icmp_type": icmp_type_if_applicable,
      "icmp_code": icmp_code_if_applicable
    }
  ]
}

IMPORTANT:
- Generate ONLY ONE filter rule in the filters array
- The rule should have action "drop" to block suspicious traffic
- Focus on the most critical security threat identified
- Your response must be valid JSON that can be parsed directly."#;

const SECURITY_FOCUS: &str = "

Focus on SECURITY-ORIENTED filtering:
- Identify the MOST CRITICAL security threat from the traffic patterns
- Generate ONE drop rule to block the most suspicious activity
- Consider port scanning, brute force attacks, or unusual connection patterns
- Prioritize threats that could lead to system compromise";

const PERFORMANCE_FOCUS: &str = "

Focus on PERFORMANCE-ORIENTED filtering:
- Identify the biggest performance bottleneck or resource waster
- Generate ONE drop rule to block bandwidth-consuming or unnecessary traffic
- Consider reducing overhead from repetitive or malicious connections
- Focus on traffic that impacts system performance most";

const BALANCED_FOCUS: &str = "

Provide BALANCED analysis:
- Identify the most significant threat considering both security and performance
- Generate ONE drop rule that provides maximum protection benefit
- Balance security threat mitigation with system performance";

pub fn system_prompt(mode: AnalysisMode, custom: &str) -> String {
    let focus = match mode {
        AnalysisMode::Security => SECURITY_FOCUS,
        AnalysisMode::Performance => PERFORMANCE_FOCUS,
        AnalysisMode::Balanced => BALANCED_FOCUS,
    };
    let mut prompt = format!("{BASE_PROMPT}{focus}");
    if !custom.trim().is_empty() {
        prompt.push_str("\n\nAdditional Instructions:\n");
        prompt.push_str(custom);
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use chrono::Utc;
    use conntracker_common::IPPROTO_TCP;

    use crate::telemetry::{ConnectionRecord, StaticTelemetry};

    type Seen = Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>;

    #[derive(Clone)]
    struct MockService {
        status: StatusCode,
        body: String,
        delay: Duration,
        seen: Seen,
    }

    async fn completions(
        State(mock): State<MockService>,
        headers: HeaderMap,
        axum::Json(body): axum::Json<serde_json::Value>,
    ) -> (StatusCode, String) {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        mock.seen.lock().unwrap().push((auth, body));
        tokio::time::sleep(mock.delay).await;
        (mock.status, mock.body.clone())
    }

    async fn spawn_mock(status: StatusCode, body: String) -> (String, Seen) {
        spawn_slow_mock(status, body, Duration::ZERO).await
    }

    async fn spawn_slow_mock(status: StatusCode, body: String, delay: Duration) -> (String, Seen) {
        let seen = Seen::default();
        let mock = MockService {
            status,
            body,
            delay,
            seen: seen.clone(),
        };
        let app = Router::new()
            .route("/v1/chat/completions", post(completions))
            .with_state(mock);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/v1/chat/completions"), seen)
    }

    fn envelope(content: &str) -> String {
        serde_json::json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 1200, "completion_tokens": 80, "total_tokens": 1280 }
        })
        .to_string()
    }

    fn synthesizer(endpoint: &str, api_key: &str) -> Synthesizer {
        let config = GenerationConfig {
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            timeout_secs: 5,
            ..Default::default()
        };
        Synthesizer::new(config, Arc::new(Metrics::new())).unwrap()
    }

    fn telemetry() -> StaticTelemetry {
        let now = Utc::now();
        let conn = ConnectionRecord {
            src_ip: Ipv4Addr::new(203, 0, 113, 7),
            dst_ip: Ipv4Addr::new(10, 0, 0, 2),
            src_port: 51000,
            dst_port: 22,
            protocol: IPPROTO_TCP,
            packets: 400,
            bytes: 24000,
            ip_id: 3,
            first_seen: now,
            last_seen: now,
            tcp: None,
        };
        let mut telemetry = StaticTelemetry::default();
        telemetry.snapshot.connections = vec![conn.clone(), conn];
        telemetry
    }

    const SSH_RULE: &str = r#"{
        "analysis": "Repeated SSH attempts from 203.0.113.7",
        "suggestions": ["Enable fail2ban"],
        "filters": [{
            "rule_type": "tcp",
            "src_ip": "203.0.113.7",
            "dst_ip": "",
            "src_port": 0,
            "dst_port": 22,
            "protocol": "tcp",
            "action": "drop",
            "enabled": true,
            "comment": "ssh brute force",
            "tcp_flags": 2,
            "tcp_flags_mask": 18
        }]
    }"#;

    #[tokio::test]
    async fn fenced_response_yields_one_rule() {
        let content = format!("```json\n{SSH_RULE}\n```");
        let (url, seen) = spawn_mock(StatusCode::OK, envelope(&content)).await;
        let synth = synthesizer(&url, "sk-test");

        let response = synth
            .synthesize(&telemetry(), &AnalysisRequest::default())
            .await
            .unwrap();

        assert!(response.success, "{response:?}");
        assert_eq!(response.filters.len(), 1);
        let rule = &response.filters[0];
        assert_eq!(rule.action, Action::Drop);
        assert_eq!(rule.dst_port, 22);
        assert_eq!(rule.src_ip.to_string(), "203.0.113.7");
        assert_eq!(rule.dst_ip.to_string(), "any");
        assert_eq!(response.analysis, "Repeated SSH attempts from 203.0.113.7");
        assert_eq!(response.suggestions, vec!["Enable fail2ban".to_string()]);
        assert_eq!(response.tokens_used, 1280);
        assert_eq!(response.usage.unwrap().prompt_tokens, 1200);
        assert!(response.discarded.is_empty());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (auth, body) = &seen[0];
        assert_eq!(auth.as_deref(), Some("Bearer sk-test"));
        assert_eq!(body["model"], DEFAULT_MODEL);
        assert_eq!(body["max_tokens"], 2000);
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][0]["role"], "system");
        assert!(
            body["messages"][0]["content"]
                .as_str()
                .unwrap()
                .contains("SECURITY-ORIENTED")
        );
        let user = body["messages"][1]["content"].as_str().unwrap();
        assert!(user.starts_with("Analyze the following network connection data"));
        assert!(user.contains("- 203.0.113.7: 2 connections"));
    }

    #[tokio::test]
    async fn non_success_status_is_transport_error() {
        let (url, _) = spawn_mock(StatusCode::UNAUTHORIZED, r#"{"error":"bad key"}"#.into()).await;
        let synth = synthesizer(&url, "sk-test");

        let err = synth
            .synthesize(&telemetry(), &AnalysisRequest::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("401"), "{err}");
    }

    #[tokio::test]
    async fn envelope_error_is_transport_error() {
        let body = r#"{"choices":[],"error":{"message":"model overloaded","type":"server_error"}}"#;
        let (url, _) = spawn_mock(StatusCode::OK, body.into()).await;
        let synth = synthesizer(&url, "sk-test");

        let err = synth
            .synthesize(&telemetry(), &AnalysisRequest::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("model overloaded"));
    }

    #[tokio::test]
    async fn missing_choices_is_transport_error() {
        let (url, _) = spawn_mock(StatusCode::OK, r#"{"choices":[]}"#.into()).await;
        let synth = synthesizer(&url, "sk-test");

        let err = synth
            .synthesize(&telemetry(), &AnalysisRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SynthesisError::Transport(ref m) if m.contains("no choices")));
    }

    #[tokio::test]
    async fn fenced_response_without_rules_succeeds() {
        let content = "```json\n{\"analysis\":\"x\",\"suggestions\":[],\"filters\":[]}\n```";
        let (url, _) = spawn_mock(StatusCode::OK, envelope(content)).await;
        let synth = synthesizer(&url, "sk-test");

        let response = synth
            .synthesize(&telemetry(), &AnalysisRequest::default())
            .await
            .unwrap();
        assert!(response.success, "{response:?}");
        assert!(response.filters.is_empty());
        assert!(response.discarded.is_empty());
        assert!(response.suggestions.is_empty());
        assert_eq!(response.analysis, "x");
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn uppercase_fence_tag_is_accepted() {
        let content = format!("```JSON\n{SSH_RULE}\n```");
        let (url, _) = spawn_mock(StatusCode::OK, envelope(&content)).await;
        let synth = synthesizer(&url, "sk-test");

        let response = synth
            .synthesize(&telemetry(), &AnalysisRequest::default())
            .await
            .unwrap();
        assert!(response.success, "{response:?}");
        assert_eq!(response.filters.len(), 1);
    }

    #[tokio::test]
    async fn null_fields_in_proposal_are_accepted() {
        let content = serde_json::json!({
            "analysis": "ping flood",
            "filters": [{
                "rule_type": "icmp",
                "src_ip": null,
                "dst_ip": "10.0.0.2",
                "protocol": null,
                "action": "drop",
                "enabled": true,
                "comment": null,
                "icmp_type": 8,
                "icmp_code": null,
                "inner_src_ip": null,
                "inner_dst_ip": null,
                "inner_protocol": null
            }]
        })
        .to_string();
        let (url, _) = spawn_mock(StatusCode::OK, envelope(&content)).await;
        let synth = synthesizer(&url, "sk-test");

        let response = synth
            .synthesize(&telemetry(), &AnalysisRequest::default())
            .await
            .unwrap();
        assert!(response.discarded.is_empty(), "{:?}", response.discarded);
        assert_eq!(response.filters.len(), 1);
        let rule = &response.filters[0];
        assert_eq!(rule.src_ip.to_string(), "any");
        assert_eq!(rule.protocol.as_str(), "icmp");
        assert!(rule.comment.is_empty());
    }

    #[tokio::test]
    async fn slow_service_times_out_as_transport_error() {
        let (url, seen) = spawn_slow_mock(
            StatusCode::OK,
            envelope(SSH_RULE),
            Duration::from_secs(5),
        )
        .await;
        let config = GenerationConfig {
            endpoint: url,
            api_key: "sk-test".into(),
            timeout_secs: 1,
            ..Default::default()
        };
        let synth = Synthesizer::new(config, Arc::new(Metrics::new())).unwrap();

        let started = std::time::Instant::now();
        let err = synth
            .synthesize(&telemetry(), &AnalysisRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SynthesisError::Transport(_)), "{err}");
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_content_reports_raw_response() {
        let (url, _) = spawn_mock(StatusCode::OK, envelope("I think you should block it")).await;
        let synth = synthesizer(&url, "sk-test");

        let response = synth
            .synthesize(&telemetry(), &AnalysisRequest::default())
            .await
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.failure, Some(FailureKind::ContentParse));
        let error = response.error.unwrap();
        assert!(error.starts_with("Failed to parse AI response as JSON: "));
        assert!(error.ends_with("Raw response: I think you should block it"));
        assert_eq!(response.tokens_used, 1280);
    }

    #[tokio::test]
    async fn blank_credentials_skip_the_network() {
        // Nothing listens on the discard port; a request would fail as transport.
        let synth = synthesizer("http://127.0.0.1:9/v1/chat/completions", "  ");

        let response = synth
            .synthesize(&telemetry(), &AnalysisRequest::default())
            .await
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.failure, Some(FailureKind::Configuration));
        assert_eq!(
            response.error.as_deref(),
            Some("Configuration validation failed: missing api_key")
        );
    }

    #[tokio::test]
    async fn extra_and_non_drop_proposals_are_discarded() {
        let content = serde_json::json!({
            "analysis": "scan",
            "filters": [
                { "rule_type": "basic", "src_ip": "198.51.100.1", "action": "allow" },
                { "rule_type": "udp", "src_ip": "198.51.100.2", "dst_port": 53, "action": "drop", "enabled": true },
                { "rule_type": "icmp", "icmp_type": 8, "action": "drop", "enabled": true },
                { "rule_type": "tcp", "src_ip": "2001:db8::1", "action": "drop" },
                { "rule_type": "tcp", "tcp_flags": "tcp_flag_value_if_applicable", "action": "drop" }
            ]
        })
        .to_string();
        let (url, _) = spawn_mock(StatusCode::OK, envelope(&content)).await;
        let synth = synthesizer(&url, "sk-test");

        let response = synth
            .synthesize(&telemetry(), &AnalysisRequest::default())
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(response.filters.len(), 1);
        assert_eq!(response.filters[0].src_ip.to_string(), "198.51.100.2");
        assert_eq!(response.filters[0].protocol.as_str(), "udp");

        let reasons: Vec<&str> = response.discarded.iter().map(|d| d.reason.as_str()).collect();
        assert_eq!(reasons.len(), 4);
        assert!(reasons[0].contains("must drop traffic"));
        assert!(reasons[1].contains("only one rule"));
        assert!(reasons[2].contains("IPv6"));
        assert!(reasons[3].starts_with("malformed rule"));
    }

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_fences("  {\"a\":1}  "), "{\"a\":1}");
        assert_eq!(strip_fences("```json{}```"), "{}");
        assert_eq!(strip_fences("```JSON\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("```Json {}```"), "{}");
    }

    #[test]
    fn prompt_follows_mode_and_custom_instructions() {
        let prompt = system_prompt(AnalysisMode::Performance, "Ignore port 8080.");
        assert!(prompt.starts_with("You are a network security expert"));
        assert!(prompt.contains("PERFORMANCE-ORIENTED"));
        assert!(prompt.ends_with("\n\nAdditional Instructions:\nIgnore port 8080."));

        let prompt = system_prompt(AnalysisMode::from_name("custom"), "");
        assert!(prompt.contains("BALANCED analysis"));
        assert!(!prompt.contains("Additional Instructions"));
    }

    #[test]
    fn request_defaults() {
        let request = AnalysisRequest::default().normalized();
        assert_eq!(request.mode(), AnalysisMode::Security);
        assert_eq!(request.scope(), DigestScope::ALL);

        let request = AnalysisRequest {
            analyze_type: "performance".into(),
            include_icmp: true,
            ..Default::default()
        }
        .normalized();
        assert_eq!(request.mode(), AnalysisMode::Performance);
        assert_eq!(
            request.scope(),
            DigestScope {
                connections: false,
                icmp: true,
                stats: false
            }
        );
    }

    #[test]
    fn config_defaults_and_status() {
        let synth = Synthesizer::new(GenerationConfig::default(), Arc::new(Metrics::new())).unwrap();
        let status = synth.status();
        assert!(!status.is_configured);
        assert!(!status.has_api_key);
        assert!(status.has_endpoint);
        assert!(status.has_model);

        let installed = synth
            .replace_config(GenerationConfig {
                endpoint: String::new(),
                api_key: "sk-live".into(),
                model: " ".into(),
                temperature: 0.0,
                timeout_secs: 0,
                debug: true,
            })
            .unwrap();
        assert_eq!(installed.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(installed.model, DEFAULT_MODEL);
        assert_eq!(installed.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(installed.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert!(synth.status().is_configured);
        assert_eq!(synth.config().redacted().api_key, REDACTED_KEY);
        assert_eq!(synth.config().api_key, "sk-live");
    }

    #[test]
    fn config_accepts_legacy_field_names() {
        let config: GenerationConfig = serde_json::from_str(
            r#"{"openai_endpoint":"http://localhost:8000/v1/chat/completions","api_key":"k","timeout":30}"#,
        )
        .unwrap();
        assert_eq!(config.endpoint, "http://localhost:8000/v1/chat/completions");
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.model, DEFAULT_MODEL);
    }

    #[test]
    fn digest_uses_request_scope() {
        let synth = Synthesizer::new(GenerationConfig::default(), Arc::new(Metrics::new())).unwrap();
        let request = AnalysisRequest {
            include_icmp: true,
            ..Default::default()
        };
        let digest = synth.digest(&telemetry(), &request).unwrap();
        assert!(digest.contains("=== ICMP Traffic ==="));
        assert!(!digest.contains("=== TCP/UDP Connections ==="));
    }
}
