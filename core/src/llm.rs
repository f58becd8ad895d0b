use crate::config::{OpenRouterSettings, ProviderSettings};
use crate::state::{ImageRef, Message, MessageRole};
use crate::stream::{
    self, BodyPayload, ByteStream, ChannelObserver, ChoicesPayload, Completion, StreamEvent,
    StreamObserver,
};
use crate::title;
use async_trait::async_trait;
use futures::{stream as byte_stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

pub const DEFAULT_MODEL: &str = "mistralai/mixtral-8x7b-instruct";
pub const DEFAULT_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";

const CONNECT_TIMEOUT_SECS: u64 = 10;
const IMAGE_MODEL_MARKERS: [&str; 2] = ["image-preview", "imagen"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("stream interrupted: {0}")]
    Stream(String),
    #[error("response could not be decoded: {0}")]
    Decode(String),
    #[error("HTTP client build failed: {0}")]
    ClientBuild(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LlmProviderKind {
    #[default]
    OpenRouter,
    Mock,
}

/// Output the request asks the model for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Modality {
    #[default]
    Text,
    ImageAndText,
}

impl Modality {
    /// Image-capable variants are recognised by their identifier.
    pub fn for_model(model: &str) -> Self {
        if IMAGE_MODEL_MARKERS
            .iter()
            .any(|marker| model.contains(marker))
        {
            Self::ImageAndText
        } else {
            Self::Text
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: MessageRole,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

impl From<&Message> for ChatTurn {
    fn from(message: &Message) -> Self {
        Self::new(message.role, message.content.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageConfig {
    pub aspect_ratio: String,
    pub image_size: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatTurn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_config: Option<ImageConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    /// History followed by the prompt as a new user turn.
    pub fn chat(model: &str, history: &[ChatTurn], prompt: &str) -> Self {
        let mut messages = history.to_vec();
        messages.push(ChatTurn::new(MessageRole::User, prompt));
        Self {
            model: model.to_string(),
            messages,
            stream: None,
            modalities: None,
            image_config: None,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn streaming(mut self) -> Self {
        self.stream = Some(true);
        self
    }

    pub fn with_modality(mut self, modality: Modality) -> Self {
        if modality == Modality::ImageAndText {
            self.modalities = Some(vec!["image".to_string(), "text".to_string()]);
            self.image_config = Some(ImageConfig {
                aspect_ratio: "16:9".to_string(),
                image_size: "4K".to_string(),
            });
        }
        self
    }

    /// Content of the final user turn.
    pub fn prompt(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|turn| turn.role == MessageRole::User)
            .map(|turn| turn.content.as_str())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts made after the first one fails.
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: LlmProviderKind,
    pub default_model: String,
    pub retry: RetryPolicy,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProviderKind::OpenRouter,
            default_model: DEFAULT_MODEL.to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Send a streaming request and hand back the raw event body.
    async fn open_stream(&self, request: &CompletionRequest) -> Result<ByteStream, TransportError>;

    /// Send a single-shot request and return the whole reply.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, TransportError>;
}

/// Chat-completions client for OpenRouter-compatible endpoints.
pub struct OpenRouterProvider {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    referer: Option<String>,
    app_title: Option<String>,
}

impl OpenRouterProvider {
    pub fn new(settings: &OpenRouterSettings) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|err| TransportError::ClientBuild(err.to_string()))?;
        Ok(Self {
            http,
            endpoint: settings.endpoint.clone(),
            api_key: settings.api_key.clone(),
            referer: settings.referer.clone(),
            app_title: settings.app_title.clone(),
        })
    }

    async fn send(&self, request: &CompletionRequest) -> Result<reqwest::Response, TransportError> {
        let mut builder = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(request);
        if let Some(referer) = &self.referer {
            builder = builder.header("HTTP-Referer", referer);
        }
        if let Some(title) = &self.app_title {
            builder = builder.header("X-Title", title);
        }
        let response = builder
            .send()
            .await
            .map_err(|err| TransportError::Request(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read error body>".to_string());
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl CompletionProvider for OpenRouterProvider {
    async fn open_stream(&self, request: &CompletionRequest) -> Result<ByteStream, TransportError> {
        let response = self.send(request).await?;
        let body = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|err| TransportError::Stream(err.to_string()))
        });
        Ok(Box::pin(body))
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, TransportError> {
        let response = self.send(request).await?;
        let text = response
            .text()
            .await
            .map_err(|err| TransportError::Request(err.to_string()))?;
        parse_completion(&text)
    }
}

/// Extract `choices[0].message` from a non-streaming response body.
pub fn parse_completion(body: &str) -> Result<Completion, TransportError> {
    let payload: ChoicesPayload =
        serde_json::from_str(body).map_err(|err| TransportError::Decode(err.to_string()))?;
    let choice = payload
        .choices
        .and_then(|choices| choices.into_iter().next())
        .ok_or_else(|| TransportError::Decode("response contained no choices".to_string()))?;
    let BodyPayload { content, images } = choice.message.unwrap_or_default();
    Ok(Completion {
        text: content.unwrap_or_default(),
        images: images.unwrap_or_default(),
    })
}

/// Scripted outcome for one [`MockProvider`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    /// Stream these fragments, then `[DONE]`.
    Fragments(Vec<String>),
    /// Stream fragments followed by generated images.
    WithImages(Vec<String>, Vec<ImageRef>),
    /// Hand these byte chunks to the decoder verbatim.
    Raw(Vec<String>),
    /// Deliver the fragments, then break the body with `error`.
    Interrupted(Vec<String>, TransportError),
    /// Fail before any body is returned.
    Fail(TransportError),
}

impl MockReply {
    pub fn fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Fragments(fragments.into_iter().map(Into::into).collect())
    }
}

/// In-process provider. Scripted replies are consumed in order; once a
/// queue is empty the provider echoes the prompt.
#[derive(Default)]
pub struct MockProvider {
    streams: Mutex<VecDeque<MockReply>>,
    completions: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockProvider {
    pub fn echo() -> Self {
        Self::default()
    }

    pub fn with_streams(self, replies: impl IntoIterator<Item = MockReply>) -> Self {
        self.streams.lock().extend(replies);
        self
    }

    pub fn with_completions(self, replies: impl IntoIterator<Item = MockReply>) -> Self {
        self.completions.lock().extend(replies);
        self
    }

    pub fn push_stream(&self, reply: MockReply) {
        self.streams.lock().push_back(reply);
    }

    pub fn push_completion(&self, reply: MockReply) {
        self.completions.lock().push_back(reply);
    }

    /// Every request received so far, streaming and single-shot.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    fn echo_fragments(request: &CompletionRequest) -> Vec<String> {
        let reply = format!("[Mock] {}: received '{}'.", request.model, request.prompt());
        reply
            .split_inclusive(' ')
            .map(str::to_string)
            .collect()
    }
}

fn sse_units(fragments: &[String], images: &[ImageRef]) -> Vec<Result<Vec<u8>, TransportError>> {
    let mut chunks: Vec<Result<Vec<u8>, TransportError>> = fragments
        .iter()
        .map(|fragment| {
            let unit = serde_json::json!({ "choices": [{ "delta": { "content": fragment } }] });
            Ok(format!("data: {unit}\n\n").into_bytes())
        })
        .collect();
    if !images.is_empty() {
        let unit = serde_json::json!({ "choices": [{ "delta": { "images": images } }] });
        chunks.push(Ok(format!("data: {unit}\n\n").into_bytes()));
    }
    chunks
}

#[async_trait]
impl CompletionProvider for MockProvider {
    async fn open_stream(&self, request: &CompletionRequest) -> Result<ByteStream, TransportError> {
        self.requests.lock().push(request.clone());
        let reply = self.streams.lock().pop_front();
        let chunks = match reply {
            None => {
                let mut chunks = sse_units(&Self::echo_fragments(request), &[]);
                chunks.push(Ok(b"data: [DONE]\n\n".to_vec()));
                chunks
            }
            Some(MockReply::Fragments(fragments)) => vec![Ok(stream::encode_sse(&fragments))],
            Some(MockReply::WithImages(fragments, images)) => {
                let mut chunks = sse_units(&fragments, &images);
                chunks.push(Ok(b"data: [DONE]\n\n".to_vec()));
                chunks
            }
            Some(MockReply::Raw(raw)) => raw.into_iter().map(|c| Ok(c.into_bytes())).collect(),
            Some(MockReply::Interrupted(fragments, err)) => {
                let mut chunks = sse_units(&fragments, &[]);
                chunks.push(Err(err));
                chunks
            }
            Some(MockReply::Fail(err)) => return Err(err),
        };
        Ok(Box::pin(byte_stream::iter(chunks)))
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, TransportError> {
        self.requests.lock().push(request.clone());
        let reply = self.completions.lock().pop_front();
        match reply {
            None => Ok(Completion {
                text: Self::echo_fragments(request).concat(),
                images: Vec::new(),
            }),
            Some(MockReply::Fragments(fragments)) => Ok(Completion {
                text: fragments.concat(),
                images: Vec::new(),
            }),
            Some(MockReply::WithImages(fragments, images)) => Ok(Completion {
                text: fragments.concat(),
                images,
            }),
            Some(MockReply::Raw(raw)) => parse_completion(&raw.concat()),
            Some(MockReply::Interrupted(_, err)) | Some(MockReply::Fail(err)) => Err(err),
        }
    }
}

/// Front door to a completion provider: request shaping, retries,
/// and title generation.
#[derive(Clone)]
pub struct LlmDriver {
    config: LlmConfig,
    provider: Arc<dyn CompletionProvider>,
}

impl LlmDriver {
    pub fn new(config: LlmConfig, provider: Arc<dyn CompletionProvider>) -> Self {
        Self { config, provider }
    }

    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, TransportError> {
        let config = LlmConfig {
            provider: settings.provider,
            default_model: settings.open_router.model.clone(),
            retry: settings.retry,
        };
        let provider: Arc<dyn CompletionProvider> = match settings.provider {
            LlmProviderKind::OpenRouter => Arc::new(OpenRouterProvider::new(&settings.open_router)?),
            LlmProviderKind::Mock => Arc::new(MockProvider::echo()),
        };
        Ok(Self::new(config, provider))
    }

    /// Echoing mock driver with immediate retries.
    pub fn fake() -> Self {
        Self::with_mock(Arc::new(MockProvider::echo()))
    }

    pub fn with_mock(provider: Arc<MockProvider>) -> Self {
        let config = LlmConfig {
            provider: LlmProviderKind::Mock,
            default_model: "mock".to_string(),
            retry: RetryPolicy::immediate(2),
        };
        Self::new(config, provider)
    }

    pub fn provider_kind(&self) -> LlmProviderKind {
        self.config.provider
    }

    pub fn default_model(&self) -> &str {
        &self.config.default_model
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.config.retry
    }

    /// Stream a reply to `prompt` given the prior `history`.
    ///
    /// Failed attempts are retried per the retry policy; each new attempt
    /// restarts accumulation. The observer sees `on_error` once, only after
    /// the retry budget is spent.
    pub async fn stream_completion(
        &self,
        prompt: &str,
        history: &[ChatTurn],
        model: &str,
        modality: Modality,
        observer: &mut dyn StreamObserver,
    ) -> Result<Completion, TransportError> {
        let request = CompletionRequest::chat(model, history, prompt)
            .streaming()
            .with_modality(modality);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = match self.provider.open_stream(&request).await {
                Ok(body) => stream::consume(body, observer).await,
                Err(err) => Err(err),
            };
            match outcome {
                Ok(completion) => {
                    info!(
                        model,
                        attempt,
                        chars = completion.text.len(),
                        images = completion.images.len(),
                        "completion stream finished"
                    );
                    observer.on_complete(&completion.text, &completion.images);
                    return Ok(completion);
                }
                Err(err) if attempt <= self.config.retry.max_retries => {
                    warn!(%err, model, attempt, "completion stream failed, retrying");
                    observer.on_retry(attempt, &err);
                    sleep(self.config.retry.delay).await;
                }
                Err(err) => {
                    error!(%err, model, attempts = attempt, "completion stream failed");
                    observer.on_error(&err);
                    return Err(err);
                }
            }
        }
    }

    /// Channel form of [`LlmDriver::stream_completion`]. The receiver ends
    /// with exactly one `Completed` or `Failed` event.
    pub fn stream_events(
        &self,
        prompt: String,
        history: Vec<ChatTurn>,
        model: String,
        modality: Modality,
    ) -> UnboundedReceiver<StreamEvent> {
        let (tx, rx) = unbounded_channel();
        let driver = self.clone();
        tokio::spawn(async move {
            let mut observer = ChannelObserver::new(tx);
            if let Err(err) = driver
                .stream_completion(&prompt, &history, &model, modality, &mut observer)
                .await
            {
                debug!(%err, "event stream ended with a failure");
            }
        });
        rx
    }

    /// Single-shot completion with the same request shape and retry policy.
    pub async fn complete(
        &self,
        prompt: &str,
        history: &[ChatTurn],
        model: &str,
        modality: Modality,
    ) -> Result<Completion, TransportError> {
        let request = CompletionRequest::chat(model, history, prompt).with_modality(modality);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.provider.complete(&request).await {
                Ok(completion) => return Ok(completion),
                Err(err) if attempt <= self.config.retry.max_retries => {
                    warn!(%err, model, attempt, "completion failed, retrying");
                    sleep(self.config.retry.delay).await;
                }
                Err(err) => {
                    error!(%err, model, attempts = attempt, "completion failed");
                    return Err(err);
                }
            }
        }
    }

    /// Derive a short chat title from the first user message. Never fails:
    /// provider errors and empty replies fall back to the message's first
    /// words.
    pub async fn generate_title(&self, first_message: &str) -> String {
        let request = title::title_request(&self.config.default_model, first_message);
        let title = match self.provider.complete(&request).await {
            Ok(reply) => title::clean_title(&reply.text).unwrap_or_else(|| {
                warn!("title generation returned nothing, using fallback");
                title::fallback_title(first_message)
            }),
            Err(err) => {
                warn!(%err, "title generation failed, using fallback");
                title::fallback_title(first_message)
            }
        };
        if title.is_empty() {
            title::DEFAULT_TITLE.to_string()
        } else {
            title
        }
    }
}
