use crate::config::ProviderSettings;
use crate::llm::{ChatTurn, LlmDriver, Modality, TransportError};
use crate::state::{
    Chat, ChatData, ChatId, ChatPreset, ChatSummary, ImageRef, Message, MessageRole, Settings,
};
use crate::store::{ChatStore, FileBackend, StorageBackend, StoreScope};
use crate::stream::{Completion, StreamEvent, StreamObserver};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Prefix of assistant messages that record a failed reply.
pub const ERROR_MARKER: &str = "❌";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("a reply is already streaming for chat {0}")]
    ReplyInFlight(ChatId),
    #[error("chat {0} no longer exists")]
    ChatNotFound(ChatId),
}

/// Who the session acts for. Passed in explicitly instead of being read
/// from shared storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    pub user_id: Option<String>,
}

impl SessionContext {
    pub fn global() -> Self {
        Self::default()
    }

    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }

    pub fn scope(&self) -> StoreScope {
        match &self.user_id {
            Some(user_id) => StoreScope::User(user_id.clone()),
            None => StoreScope::Global,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Minimum time a deletion keeps the caller waiting.
    pub delete_grace: Duration,
    pub credential_warning: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            delete_grace: Duration::from_millis(500),
            credential_warning: None,
        }
    }
}

/// Persisted assistant turn produced by a send, edit or regenerate.
#[derive(Debug, Clone)]
pub struct ReplyOutcome {
    pub chat_id: ChatId,
    pub reply: Message,
    /// Set when the reply records a transport failure.
    pub error: Option<TransportError>,
}

#[derive(Debug)]
pub struct SendOutcome {
    pub user_message: Message,
    pub reply: ReplyOutcome,
    /// Background title derivation started by this send.
    pub title_task: Option<JoinHandle<()>>,
}

#[derive(Debug)]
pub enum SessionEvent {
    Stream(StreamEvent),
    Recorded(ReplyOutcome),
    Rejected(SessionError),
}

type Previews = Arc<Mutex<HashMap<ChatId, String>>>;

/// Marks a chat as having a reply in flight until dropped.
struct InFlight {
    previews: Previews,
    chat_id: ChatId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.previews.lock().remove(&self.chat_id);
    }
}

/// Mirrors the partial reply into the preview map before handing each
/// callback to the caller's observer.
struct PreviewObserver<'a> {
    previews: &'a Mutex<HashMap<ChatId, String>>,
    chat_id: &'a str,
    inner: &'a mut dyn StreamObserver,
}

impl PreviewObserver<'_> {
    fn set_preview(&self, text: &str) {
        if let Some(preview) = self.previews.lock().get_mut(self.chat_id) {
            preview.clear();
            preview.push_str(text);
        }
    }
}

impl StreamObserver for PreviewObserver<'_> {
    fn on_fragment(&mut self, fragment: &str, text: &str, images: &[ImageRef]) {
        self.set_preview(text);
        self.inner.on_fragment(fragment, text, images);
    }

    fn on_complete(&mut self, text: &str, images: &[ImageRef]) {
        self.inner.on_complete(text, images);
    }

    fn on_error(&mut self, error: &TransportError) {
        self.inner.on_error(error);
    }

    fn on_retry(&mut self, attempt: u32, error: &TransportError) {
        self.set_preview("");
        self.inner.on_retry(attempt, error);
    }
}

struct ForwardObserver {
    tx: UnboundedSender<SessionEvent>,
}

impl ForwardObserver {
    fn emit(&self, event: StreamEvent) {
        self.tx.send(SessionEvent::Stream(event)).ok();
    }
}

impl StreamObserver for ForwardObserver {
    fn on_fragment(&mut self, fragment: &str, text: &str, images: &[ImageRef]) {
        self.emit(StreamEvent::Fragment {
            delta: fragment.to_owned(),
            text: text.to_owned(),
            images: images.to_vec(),
        });
    }

    fn on_complete(&mut self, text: &str, images: &[ImageRef]) {
        self.emit(StreamEvent::Completed(Completion {
            text: text.to_owned(),
            images: images.to_vec(),
        }));
    }

    fn on_error(&mut self, error: &TransportError) {
        self.emit(StreamEvent::Failed(error.clone()));
    }

    fn on_retry(&mut self, attempt: u32, error: &TransportError) {
        self.emit(StreamEvent::Retrying {
            attempt,
            error: error.clone(),
        });
    }
}

/// Orchestrates the chat store and the completion driver for one user.
///
/// Holds no persistent state of its own: partial replies live in memory
/// only and reach the store once the stream completes or fails.
#[derive(Clone)]
pub struct ChatSession {
    store: ChatStore,
    llm: LlmDriver,
    options: SessionOptions,
    previews: Previews,
}

impl ChatSession {
    pub fn new(store: ChatStore, llm: LlmDriver) -> Self {
        Self::with_options(store, llm, SessionOptions::default())
    }

    pub fn with_options(store: ChatStore, llm: LlmDriver, options: SessionOptions) -> Self {
        if store.current_id().is_none() {
            if let Some(first) = store.list_chats().first() {
                store.set_current(&first.id);
            }
        }
        Self {
            store,
            llm,
            options,
            previews: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn open(
        context: &SessionContext,
        backend: Arc<dyn StorageBackend>,
        llm: LlmDriver,
        options: SessionOptions,
    ) -> Self {
        let store = ChatStore::open(backend, context.scope());
        Self::with_options(store, llm, options)
    }

    /// Build a session from loaded provider settings. A missing key turns
    /// into a standing warning instead of an error.
    pub fn from_settings(
        context: &SessionContext,
        settings: &ProviderSettings,
    ) -> Result<Self, TransportError> {
        let backend: Arc<dyn StorageBackend> = match &settings.data_dir {
            Some(dir) => Arc::new(FileBackend::new(dir.clone())),
            None => Arc::new(FileBackend::default_location()),
        };
        let llm = LlmDriver::from_settings(settings)?;
        let credential_warning = settings.credential_status().err().map(|err| {
            warn!(%err, "provider credential not configured");
            err.user_message()
        });
        let options = SessionOptions {
            credential_warning,
            ..SessionOptions::default()
        };
        Ok(Self::open(context, backend, llm, options))
    }

    pub fn store(&self) -> &ChatStore {
        &self.store
    }

    pub fn llm(&self) -> &LlmDriver {
        &self.llm
    }

    pub fn credential_warning(&self) -> Option<&str> {
        self.options.credential_warning.as_deref()
    }

    pub fn list_chats(&self) -> Vec<Chat> {
        self.store.list_chats()
    }

    pub fn summaries(&self) -> Vec<ChatSummary> {
        self.store.summaries()
    }

    pub fn get_chat(&self, chat_id: &str) -> Option<Chat> {
        self.store.get_chat(chat_id)
    }

    pub fn current_chat(&self) -> Option<Chat> {
        self.store.current_chat()
    }

    pub fn create_chat(&self) -> Chat {
        self.store.create_chat(None, None, None)
    }

    pub fn create_chat_with_preset(&self, preset: &ChatPreset) -> Chat {
        self.store
            .create_chat(None, preset.tool_id.clone(), preset.model.clone())
    }

    pub fn select_chat(&self, chat_id: &str) -> bool {
        self.store.set_current(chat_id)
    }

    pub fn settings(&self) -> Settings {
        self.store.settings()
    }

    pub fn update_settings(&self, settings: Settings) -> bool {
        self.store.update_settings(settings)
    }

    pub fn snapshot(&self) -> ChatData {
        self.store.get_all_data()
    }

    /// Partial reply text for a chat that is currently streaming.
    pub fn streaming_preview(&self, chat_id: &str) -> Option<String> {
        self.previews.lock().get(chat_id).cloned()
    }

    pub fn is_streaming(&self, chat_id: &str) -> bool {
        self.previews.lock().contains_key(chat_id)
    }

    /// Delete a chat after holding the caller for the configured grace
    /// period, so the UI does not flash.
    pub async fn delete_chat(&self, chat_id: &str) -> bool {
        sleep(self.options.delete_grace).await;
        self.store.delete_chat(chat_id)
    }

    /// Send `text` in the current chat, creating one when none is current.
    ///
    /// Returns `Ok(None)` for blank input. Transport failures do not fail
    /// the call; they are recorded as an error-marked assistant reply.
    pub async fn send_message(
        &self,
        text: &str,
        observer: &mut dyn StreamObserver,
    ) -> Result<Option<SendOutcome>, SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        let (chat, needs_title) = match self.store.current_chat() {
            Some(chat) => {
                let untitled = chat.title.is_none() && chat.messages.is_empty();
                (chat, untitled)
            }
            None => (self.store.create_chat(None, None, None), true),
        };
        let _in_flight = self.begin_reply(&chat.id)?;

        let title_task = needs_title.then(|| self.spawn_title(chat.id.clone(), text.to_owned()));
        let user_message = self
            .store
            .append_message(&chat.id, MessageRole::User, text)
            .ok_or_else(|| SessionError::ChatNotFound(chat.id.clone()))?;

        let history = turns(&chat.messages);
        let reply = self.stream_reply(&chat, text, history, observer).await?;
        Ok(Some(SendOutcome {
            user_message,
            reply,
            title_task,
        }))
    }

    /// Rewrite a user message in the current chat, drop everything after
    /// it and request a fresh reply. Unknown ids and non-user messages are
    /// ignored.
    pub async fn edit_message(
        &self,
        message_id: &str,
        text: &str,
        observer: &mut dyn StreamObserver,
    ) -> Result<Option<ReplyOutcome>, SessionError> {
        let text = text.trim();
        let Some(chat) = self.store.current_chat() else {
            return Ok(None);
        };
        let is_user_message = chat
            .message(message_id)
            .map(|message| message.role == MessageRole::User)
            .unwrap_or(false);
        if text.is_empty() || !is_user_message {
            return Ok(None);
        }
        let _in_flight = self.begin_reply(&chat.id)?;

        let Some(edited) = self
            .store
            .edit_message_and_truncate(&chat.id, message_id, text)
        else {
            return Ok(None);
        };
        let chat = self
            .store
            .get_chat(&chat.id)
            .ok_or_else(|| SessionError::ChatNotFound(chat.id.clone()))?;
        let kept = chat.messages.len().saturating_sub(1);
        let history = turns(&chat.messages[..kept]);
        let reply = self
            .stream_reply(&chat, &edited.content, history, observer)
            .await?;
        Ok(Some(reply))
    }

    /// Replace an assistant reply with a new one for the same user turn.
    /// No-op unless the target is an assistant message directly preceded
    /// by a user message.
    pub async fn regenerate(
        &self,
        message_id: &str,
        observer: &mut dyn StreamObserver,
    ) -> Result<Option<ReplyOutcome>, SessionError> {
        let Some(chat) = self.store.current_chat() else {
            return Ok(None);
        };
        let Some(index) = chat.position_of(message_id) else {
            return Ok(None);
        };
        if chat.messages[index].role != MessageRole::Assistant || index == 0 {
            return Ok(None);
        }
        let prompt_message = &chat.messages[index - 1];
        if prompt_message.role != MessageRole::User {
            return Ok(None);
        }
        let _in_flight = self.begin_reply(&chat.id)?;

        if self
            .store
            .truncate_after(&chat.id, &prompt_message.id)
            .is_none()
        {
            return Ok(None);
        }
        let history = turns(&chat.messages[..index - 1]);
        let prompt = prompt_message.content.clone();
        let reply = self.stream_reply(&chat, &prompt, history, observer).await?;
        Ok(Some(reply))
    }

    /// Channel form of [`ChatSession::send_message`] for presentation
    /// layers that poll. The stream ends after `Recorded` or `Rejected`.
    pub fn send_message_streaming(&self, text: impl Into<String>) -> UnboundedReceiver<SessionEvent> {
        let (tx, rx) = unbounded_channel();
        let session = self.clone();
        let text = text.into();
        tokio::spawn(async move {
            let mut observer = ForwardObserver { tx: tx.clone() };
            match session.send_message(&text, &mut observer).await {
                Ok(Some(outcome)) => {
                    tx.send(SessionEvent::Recorded(outcome.reply)).ok();
                }
                Ok(None) => {}
                Err(err) => {
                    tx.send(SessionEvent::Rejected(err)).ok();
                }
            }
        });
        rx
    }

    fn begin_reply(&self, chat_id: &str) -> Result<InFlight, SessionError> {
        let mut previews = self.previews.lock();
        if previews.contains_key(chat_id) {
            warn!(chat_id, "rejecting reply while another is streaming");
            return Err(SessionError::ReplyInFlight(chat_id.to_owned()));
        }
        previews.insert(chat_id.to_owned(), String::new());
        Ok(InFlight {
            previews: self.previews.clone(),
            chat_id: chat_id.to_owned(),
        })
    }

    fn spawn_title(&self, chat_id: ChatId, first_message: String) -> JoinHandle<()> {
        let llm = self.llm.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            let title = llm.generate_title(&first_message).await;
            if store.set_title(&chat_id, title.as_str()) {
                debug!(chat_id = %chat_id, title = %title, "chat titled");
            } else {
                debug!(chat_id = %chat_id, "chat removed before its title arrived");
            }
        })
    }

    async fn stream_reply(
        &self,
        chat: &Chat,
        prompt: &str,
        history: Vec<ChatTurn>,
        observer: &mut dyn StreamObserver,
    ) -> Result<ReplyOutcome, SessionError> {
        let model = chat.model_or(self.llm.default_model()).to_string();
        let modality = Modality::for_model(&model);
        let streaming = self.store.settings().streaming_enabled;
        let mut preview = PreviewObserver {
            previews: &self.previews,
            chat_id: &chat.id,
            inner: observer,
        };

        let result = if streaming {
            self.llm
                .stream_completion(prompt, &history, &model, modality, &mut preview)
                .await
        } else {
            let result = self.llm.complete(prompt, &history, &model, modality).await;
            match &result {
                Ok(completion) => preview.on_complete(&completion.text, &completion.images),
                Err(err) => preview.on_error(err),
            }
            result
        };

        let (reply, error) = match result {
            Ok(completion) => (
                self.store
                    .append_reply(&chat.id, completion.text, completion.images),
                None,
            ),
            Err(err) => (
                self.store.append_message(
                    &chat.id,
                    MessageRole::Assistant,
                    format!("{ERROR_MARKER} {err}"),
                ),
                Some(err),
            ),
        };
        let reply = reply.ok_or_else(|| SessionError::ChatNotFound(chat.id.clone()))?;
        info!(
            chat_id = %chat.id,
            model = %model,
            failed = error.is_some(),
            "assistant reply recorded"
        );
        Ok(ReplyOutcome {
            chat_id: chat.id.clone(),
            reply,
            error,
        })
    }
}

fn turns(messages: &[Message]) -> Vec<ChatTurn> {
    messages.iter().map(ChatTurn::from).collect()
}
