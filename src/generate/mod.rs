//! Answer generation over configurable LLM providers.
//!
//! Two providers: a local generate endpoint and a cloud chat-completions
//! API. Configuration is process-wide and mutable through a single
//! writer; readers take a snapshot. Streaming produces a finite,
//! non-restartable sequence of deltas terminated by a sentinel.

mod prompts;

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::LlmSettings;
use crate::error::{Error, Result};

pub use prompts::{
    build_prompt, format_context, format_history, greeting_response, refusal_response,
    GroupProfile, PromptParts, NO_ANSWER,
};

/// Cloud call timeout.
const CLOUD_TIMEOUT_SECS: u64 = 180;
/// Local models can be slow on first load.
const LOCAL_TIMEOUT_SECS: u64 = 600;
/// Retries for connect/timeout failures against the cloud API.
const CLOUD_MAX_RETRIES: u32 = 3;

/// An LLM provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provider {
    LocalChat,
    CloudChat,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalChat => "local-chat",
            Self::CloudChat => "cloud-chat",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local-chat" => Some(Self::LocalChat),
            "cloud-chat" => Some(Self::CloudChat),
            _ => None,
        }
    }
}

/// Per-request provider/model override.
#[derive(Debug, Clone)]
pub struct ProviderChoice {
    pub provider: Provider,
    pub model: Option<String>,
}

/// Input to a generation call.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub system_prompt: Option<String>,
    pub user_prompt: String,
    pub provider_override: Option<ProviderChoice>,
}

impl GenerateRequest {
    pub fn new(parts: PromptParts) -> Self {
        Self {
            system_prompt: Some(parts.system),
            user_prompt: parts.user,
            provider_override: None,
        }
    }

    pub fn user_only(user_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: None,
            user_prompt: user_prompt.into(),
            provider_override: None,
        }
    }

    pub fn with_override(mut self, choice: Option<ProviderChoice>) -> Self {
        self.provider_override = choice;
        self
    }
}

/// A buffered generation result.
#[derive(Debug, Clone)]
pub struct GeneratedAnswer {
    pub text: String,
    pub provider: String,
    pub model: String,
}

impl GeneratedAnswer {
    /// Result with no provider attribution (test and canned paths).
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            provider: String::new(),
            model: String::new(),
        }
    }
}

/// One element of a streaming response. `Done`/`Failed` are the
/// sentinels; nothing follows them.
#[derive(Debug, Clone)]
pub enum Delta {
    Token(String),
    Done { provider: String, model: String },
    Failed(String),
}

/// The generation contract the agent depends on.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> Result<GeneratedAnswer>;

    /// Stream deltas into `tx`, terminated by a sentinel, and return
    /// the assembled answer. The default forwards the buffered result
    /// as a single token.
    async fn generate_stream(
        &self,
        request: &GenerateRequest,
        tx: mpsc::Sender<Delta>,
    ) -> Result<GeneratedAnswer> {
        match self.generate(request).await {
            Ok(answer) => {
                let _ = tx.send(Delta::Token(answer.text.clone())).await;
                let _ = tx
                    .send(Delta::Done {
                        provider: answer.provider.clone(),
                        model: answer.model.clone(),
                    })
                    .await;
                Ok(answer)
            }
            Err(err) => {
                let _ = tx.send(Delta::Failed(err.to_string())).await;
                Err(err)
            }
        }
    }
}

/// Poll deadline while draining a delta stream.
const DRAIN_POLL_MS: u64 = 100;

/// Drain a delta stream with a bounded poll: wait at most 100 ms per
/// poll, yield back to the scheduler when the producer is quiet, and
/// stop at the sentinel. Returns the assembled answer.
pub async fn drain_stream(
    receiver: &mut mpsc::Receiver<Delta>,
    mut on_token: impl FnMut(&str),
) -> Result<GeneratedAnswer> {
    let mut assembled = String::new();
    loop {
        match tokio::time::timeout(Duration::from_millis(DRAIN_POLL_MS), receiver.recv()).await {
            Ok(Some(Delta::Token(token))) => {
                on_token(&token);
                assembled.push_str(&token);
            }
            Ok(Some(Delta::Done { provider, model })) => {
                return Ok(GeneratedAnswer {
                    text: assembled,
                    provider,
                    model,
                });
            }
            Ok(Some(Delta::Failed(message))) => {
                return Err(Error::PermanentExternal(message));
            }
            Ok(None) => {
                return Err(Error::Internal("stream ended without a sentinel".into()));
            }
            Err(_elapsed) => {
                // Nothing buffered; give the scheduler a turn.
                tokio::task::yield_now().await;
            }
        }
    }
}

/// Process-wide generator configuration.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub provider: Provider,
    pub local_model: String,
    pub local_base_url: String,
    pub cloud_model: String,
    pub cloud_api_url: String,
    pub cloud_api_key: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl GeneratorConfig {
    pub fn from_settings(settings: &LlmSettings) -> Self {
        Self {
            provider: Provider::parse(&settings.provider).unwrap_or(Provider::CloudChat),
            local_model: settings.local_model.clone(),
            local_base_url: settings.local_base_url.trim_end_matches('/').to_string(),
            cloud_model: settings.cloud_model.clone(),
            cloud_api_url: settings.cloud_api_url.clone(),
            cloud_api_key: settings.cloud_api_key.clone(),
            temperature: 0.2,
            max_tokens: 2048,
        }
    }
}

enum CallError {
    /// Connect/timeout trouble; worth another attempt.
    Retry(Error),
    /// HTTP or parse failure; never retried.
    Fatal(Error),
}

/// Production generator speaking to both providers.
pub struct LlmGenerator {
    config: RwLock<GeneratorConfig>,
    /// Cached client for the local endpoint; dropped on config update.
    local_client: Mutex<Option<Arc<reqwest::Client>>>,
    cloud_client: reqwest::Client,
}

impl LlmGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        let cloud_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(CLOUD_TIMEOUT_SECS))
            .build()
            .expect("failed to build HTTP client");

        Self {
            config: RwLock::new(config),
            local_client: Mutex::new(None),
            cloud_client,
        }
    }

    /// Snapshot of the current configuration.
    pub fn snapshot(&self) -> GeneratorConfig {
        self.config.read().unwrap().clone()
    }

    /// Single-writer admin path. Invalidates the cached local client.
    pub fn update_config(&self, config: GeneratorConfig) {
        *self.config.write().unwrap() = config;
        self.local_client.lock().unwrap().take();
    }

    fn local_client(&self) -> Arc<reqwest::Client> {
        let mut guard = self.local_client.lock().unwrap();
        if let Some(client) = guard.as_ref() {
            return client.clone();
        }
        let client = Arc::new(
            reqwest::Client::builder()
                .timeout(Duration::from_secs(LOCAL_TIMEOUT_SECS))
                .build()
                .expect("failed to build HTTP client"),
        );
        *guard = Some(client.clone());
        client
    }

    /// Whether a cached local client currently exists (admin surface).
    pub fn has_cached_local_client(&self) -> bool {
        self.local_client.lock().unwrap().is_some()
    }

    fn resolve(&self, request: &GenerateRequest) -> (GeneratorConfig, Provider, String) {
        let config = self.snapshot();
        match &request.provider_override {
            Some(choice) => {
                let model = choice.model.clone().unwrap_or_else(|| match choice.provider {
                    Provider::LocalChat => config.local_model.clone(),
                    Provider::CloudChat => config.cloud_model.clone(),
                });
                (config, choice.provider, model)
            }
            None => {
                let provider = config.provider;
                let model = match provider {
                    Provider::LocalChat => config.local_model.clone(),
                    Provider::CloudChat => config.cloud_model.clone(),
                };
                (config, provider, model)
            }
        }
    }

    fn cloud_body(
        config: &GeneratorConfig,
        model: &str,
        request: &GenerateRequest,
        stream: bool,
    ) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.user_prompt}));

        json!({
            "model": model,
            "messages": messages,
            "temperature": config.temperature,
            "max_tokens": config.max_tokens,
            "stream": stream,
        })
    }

    async fn cloud_send(
        &self,
        config: &GeneratorConfig,
        body: &serde_json::Value,
    ) -> std::result::Result<reqwest::Response, CallError> {
        if config.cloud_api_key.is_empty() {
            return Err(CallError::Fatal(Error::InputInvalid(
                "cloud API key is not configured".into(),
            )));
        }

        let resp = self
            .cloud_client
            .post(&config.cloud_api_url)
            .bearer_auth(&config.cloud_api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    CallError::Retry(Error::TransientExternal(e.to_string()))
                } else {
                    CallError::Fatal(Error::TransientExternal(e.to_string()))
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let err = if status.is_server_error() || status.as_u16() == 429 {
                Error::TransientExternal(format!("cloud API HTTP {status}: {body}"))
            } else {
                Error::PermanentExternal(format!("cloud API HTTP {status}: {body}"))
            };
            // HTTP errors are not retried regardless of class.
            return Err(CallError::Fatal(err));
        }
        Ok(resp)
    }

    /// Retry loop: exponential backoff on connect/timeout only.
    async fn cloud_with_retry<F, Fut, T>(&self, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, CallError>>,
    {
        let mut delay = Duration::from_secs(1);
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(CallError::Fatal(err)) => return Err(err),
                Err(CallError::Retry(err)) => {
                    if attempt >= CLOUD_MAX_RETRIES {
                        return Err(err.into_exhausted());
                    }
                    attempt += 1;
                    warn!(attempt, error = %err, "cloud API connection error, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    async fn call_cloud(
        &self,
        config: &GeneratorConfig,
        model: &str,
        request: &GenerateRequest,
    ) -> Result<String> {
        #[derive(Deserialize)]
        struct Completion {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: Message,
        }
        #[derive(Deserialize)]
        struct Message {
            content: String,
        }

        let body = Self::cloud_body(config, model, request, false);
        let completion: Completion = self
            .cloud_with_retry(|| {
                let body = &body;
                async move {
                    let resp = self.cloud_send(config, body).await?;
                    resp.json::<Completion>().await.map_err(|e| {
                        CallError::Fatal(Error::PermanentExternal(format!(
                            "malformed cloud response: {e}"
                        )))
                    })
                }
            })
            .await?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::PermanentExternal("cloud response had no choices".into()))
    }

    async fn call_local(
        &self,
        config: &GeneratorConfig,
        model: &str,
        request: &GenerateRequest,
    ) -> Result<String> {
        #[derive(Deserialize)]
        struct LocalResponse {
            response: String,
        }

        let prompt = match &request.system_prompt {
            Some(system) => format!("{system}\n\n{}", request.user_prompt),
            None => request.user_prompt.clone(),
        };

        let url = format!("{}/api/generate", config.local_base_url);
        let resp = self
            .local_client()
            .post(&url)
            .json(&json!({
                "model": model,
                "prompt": prompt,
                "stream": false,
                "options": {
                    "temperature": config.temperature,
                    "num_predict": config.max_tokens,
                },
            }))
            .send()
            .await?
            .error_for_status()?;

        let body: LocalResponse = resp
            .json()
            .await
            .map_err(|e| Error::PermanentExternal(format!("malformed local response: {e}")))?;
        Ok(body.response)
    }

    async fn stream_cloud(
        &self,
        config: &GeneratorConfig,
        model: &str,
        request: &GenerateRequest,
        tx: &mpsc::Sender<Delta>,
    ) -> Result<String> {
        #[derive(Deserialize)]
        struct StreamChunk {
            choices: Vec<StreamChoice>,
        }
        #[derive(Deserialize)]
        struct StreamChoice {
            delta: StreamDelta,
        }
        #[derive(Deserialize, Default)]
        struct StreamDelta {
            #[serde(default)]
            content: Option<String>,
        }

        let body = Self::cloud_body(config, model, request, true);
        let resp = self
            .cloud_with_retry(|| {
                let body = &body;
                async move { self.cloud_send(config, body).await }
            })
            .await?;

        let mut assembled = String::new();
        let mut buffer = String::new();
        let mut stream = resp.bytes_stream();

        while let Some(piece) = stream.next().await {
            let piece = piece.map_err(|e| Error::TransientExternal(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&piece));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);

                let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                    continue;
                };
                if data == "[DONE]" {
                    return Ok(assembled);
                }
                let Ok(chunk) = serde_json::from_str::<StreamChunk>(data) else {
                    continue;
                };
                if let Some(content) = chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta.content)
                {
                    assembled.push_str(&content);
                    let _ = tx.send(Delta::Token(content)).await;
                }
            }
        }
        Ok(assembled)
    }

    async fn stream_local(
        &self,
        config: &GeneratorConfig,
        model: &str,
        request: &GenerateRequest,
        tx: &mpsc::Sender<Delta>,
    ) -> Result<String> {
        #[derive(Deserialize)]
        struct LocalChunk {
            #[serde(default)]
            response: String,
            #[serde(default)]
            done: bool,
        }

        let prompt = match &request.system_prompt {
            Some(system) => format!("{system}\n\n{}", request.user_prompt),
            None => request.user_prompt.clone(),
        };

        let url = format!("{}/api/generate", config.local_base_url);
        let resp = self
            .local_client()
            .post(&url)
            .json(&json!({
                "model": model,
                "prompt": prompt,
                "stream": true,
                "options": {
                    "temperature": config.temperature,
                    "num_predict": config.max_tokens,
                },
            }))
            .send()
            .await?
            .error_for_status()?;

        let mut assembled = String::new();
        let mut buffer = String::new();
        let mut stream = resp.bytes_stream();

        while let Some(piece) = stream.next().await {
            let piece = piece.map_err(|e| Error::TransientExternal(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&piece));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);
                if line.is_empty() {
                    continue;
                }
                let Ok(chunk) = serde_json::from_str::<LocalChunk>(&line) else {
                    continue;
                };
                if !chunk.response.is_empty() {
                    assembled.push_str(&chunk.response);
                    let _ = tx.send(Delta::Token(chunk.response)).await;
                }
                if chunk.done {
                    return Ok(assembled);
                }
            }
        }
        Ok(assembled)
    }
}

#[async_trait]
impl AnswerGenerator for LlmGenerator {
    async fn generate(&self, request: &GenerateRequest) -> Result<GeneratedAnswer> {
        let (config, provider, model) = self.resolve(request);
        debug!(provider = provider.as_str(), model = %model, "generating answer");

        let text = match provider {
            Provider::CloudChat => self.call_cloud(&config, &model, request).await?,
            Provider::LocalChat => self.call_local(&config, &model, request).await?,
        };

        Ok(GeneratedAnswer {
            text,
            provider: provider.as_str().to_string(),
            model,
        })
    }

    async fn generate_stream(
        &self,
        request: &GenerateRequest,
        tx: mpsc::Sender<Delta>,
    ) -> Result<GeneratedAnswer> {
        let (config, provider, model) = self.resolve(request);
        debug!(provider = provider.as_str(), model = %model, "streaming answer");

        let result = match provider {
            Provider::CloudChat => self.stream_cloud(&config, &model, request, &tx).await,
            Provider::LocalChat => self.stream_local(&config, &model, request, &tx).await,
        };

        match result {
            Ok(text) => {
                let _ = tx
                    .send(Delta::Done {
                        provider: provider.as_str().to_string(),
                        model: model.clone(),
                    })
                    .await;
                Ok(GeneratedAnswer {
                    text,
                    provider: provider.as_str().to_string(),
                    model,
                })
            }
            Err(err) => {
                let _ = tx.send(Delta::Failed(err.to_string())).await;
                Err(err)
            }
        }
    }
}
