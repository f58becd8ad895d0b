use crate::state::{
    Chat, ChatData, ChatId, ChatSummary, ImageRef, Message, MessageRole, Settings,
};
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const GLOBAL_KEY: &str = "soozai_chat_data";
const USER_KEY_PREFIX: &str = "soozai_user_data_";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage io failed for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("storage quota exceeded: {needed} bytes needed, {available} available")]
    QuotaExceeded { needed: usize, available: usize },
    #[error("invalid backup: {0}")]
    InvalidBackup(String),
}

/// Synchronous string key-value persistence.
pub trait StorageBackend: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn write(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// One `<key>.json` file per key below a root directory.
#[derive(Clone, Debug)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: PathBuf) -> Self {
        fs::create_dir_all(&root).ok();
        Self { root }
    }

    /// Backend rooted in the platform data directory, falling back to
    /// `./.sooz` when no home directory can be resolved.
    pub fn default_location() -> Self {
        let root = ProjectDirs::from("", "", "sooz")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".sooz"));
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

impl StorageBackend for FileBackend {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                key: key.to_owned(),
                source,
            }),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            key: key.to_owned(),
            source,
        };
        fs::create_dir_all(&self.root).map_err(io_err)?;
        let path = self.path_for(key);
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, value).map_err(io_err)?;
        fs::rename(&staging, &path).map_err(io_err)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                key: key.to_owned(),
                source,
            }),
        }
    }
}

/// In-process backend with an optional byte quota across all keys.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(bytes: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota: Some(bytes),
        }
    }

    /// Seed a raw value, bypassing the quota.
    pub fn insert_raw(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.lock().insert(key.into(), value.into());
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }
}

impl StorageBackend for MemoryBackend {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        if let Some(quota) = self.quota {
            let used: usize = entries
                .iter()
                .filter(|(existing, _)| existing.as_str() != key)
                .map(|(_, v)| v.len())
                .sum();
            let available = quota.saturating_sub(used);
            if value.len() > available {
                return Err(StoreError::QuotaExceeded {
                    needed: value.len(),
                    available,
                });
            }
        }
        entries.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Which snapshot a store reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreScope {
    Global,
    User(String),
}

impl StoreScope {
    pub fn storage_key(&self) -> String {
        match self {
            Self::Global => GLOBAL_KEY.to_string(),
            Self::User(user_id) => format!("{USER_KEY_PREFIX}{user_id}"),
        }
    }

    fn empty_snapshot(&self) -> ChatData {
        match self {
            Self::Global => ChatData::default(),
            Self::User(user_id) => ChatData::for_user(user_id.clone()),
        }
    }

    fn user_id(&self) -> Option<&str> {
        match self {
            Self::Global => None,
            Self::User(user_id) => Some(user_id),
        }
    }
}

/// Identity recorded in exported backups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackupFile {
    #[serde(default)]
    export_date: Option<DateTime<Utc>>,
    #[serde(default)]
    user: Option<BackupUser>,
    #[serde(default)]
    data: Option<ChatData>,
}

/// Chat repository over a single in-memory snapshot.
///
/// Every mutation runs under one write lock and is followed by a full
/// snapshot flush to the backend. Flush failures are logged and the
/// in-memory state keeps the change.
#[derive(Clone)]
pub struct ChatStore {
    backend: Arc<dyn StorageBackend>,
    scope: StoreScope,
    data: Arc<RwLock<ChatData>>,
}

impl ChatStore {
    pub fn open(backend: Arc<dyn StorageBackend>, scope: StoreScope) -> Self {
        let data = load_snapshot(backend.as_ref(), &scope);
        Self {
            backend,
            scope,
            data: Arc::new(RwLock::new(data)),
        }
    }

    pub fn in_memory() -> Self {
        Self::open(Arc::new(MemoryBackend::new()), StoreScope::Global)
    }

    pub fn scope(&self) -> &StoreScope {
        &self.scope
    }

    /// Discard the in-memory snapshot and re-read it from the backend.
    pub fn reload(&self) {
        let fresh = load_snapshot(self.backend.as_ref(), &self.scope);
        *self.data.write() = fresh;
    }

    pub fn get_all_data(&self) -> ChatData {
        self.data.read().clone()
    }

    pub fn save_all_data(&self, mut snapshot: ChatData) -> bool {
        if snapshot.repair_current() {
            warn!("dropping current chat pointer to a missing chat");
        }
        let mut data = self.data.write();
        *data = snapshot;
        self.flush(&data)
    }

    pub fn create_chat(
        &self,
        title: Option<String>,
        tool_id: Option<String>,
        model: Option<String>,
    ) -> Chat {
        let chat = Chat::new(title, tool_id, model);
        let mut data = self.data.write();
        data.chats.insert(0, chat.clone());
        data.current_chat_id = Some(chat.id.clone());
        self.flush(&data);
        info!(chat_id = %chat.id, "created chat");
        chat
    }

    pub fn get_chat(&self, chat_id: &str) -> Option<Chat> {
        self.data.read().chat(chat_id).cloned()
    }

    pub fn list_chats(&self) -> Vec<Chat> {
        self.data.read().chats.clone()
    }

    pub fn summaries(&self) -> Vec<ChatSummary> {
        self.data.read().chats.iter().map(ChatSummary::from).collect()
    }

    pub fn current_id(&self) -> Option<ChatId> {
        self.data.read().current_chat_id.clone()
    }

    pub fn current_chat(&self) -> Option<Chat> {
        let data = self.data.read();
        let id = data.current_chat_id.as_deref()?;
        data.chat(id).cloned()
    }

    /// Point the current chat at `chat_id`; unknown ids are refused.
    pub fn set_current(&self, chat_id: &str) -> bool {
        self.mutate(|data| {
            data.chat(chat_id)?;
            data.current_chat_id = Some(chat_id.to_owned());
            Some(())
        })
        .is_some()
    }

    /// Append a user or assistant turn. System turns exist on the wire only
    /// and are refused.
    pub fn append_message(
        &self,
        chat_id: &str,
        role: MessageRole,
        content: impl Into<String>,
    ) -> Option<Message> {
        if role == MessageRole::System {
            warn!(chat_id, "refusing to store a system turn");
            return None;
        }
        let message = Message::new(role, content);
        self.mutate(|data| {
            let chat = data.chat_mut(chat_id)?;
            Some(chat.push(message).clone())
        })
    }

    /// Append an assistant reply together with any generated images.
    pub fn append_reply(
        &self,
        chat_id: &str,
        content: impl Into<String>,
        images: Vec<ImageRef>,
    ) -> Option<Message> {
        let mut message = Message::new(MessageRole::Assistant, content);
        message.images = images;
        self.mutate(|data| {
            let chat = data.chat_mut(chat_id)?;
            Some(chat.push(message).clone())
        })
    }

    pub fn set_title(&self, chat_id: &str, title: impl Into<String>) -> bool {
        let title = title.into();
        self.mutate(|data| {
            let chat = data.chat_mut(chat_id)?;
            chat.title = Some(title);
            chat.touch();
            Some(())
        })
        .is_some()
    }

    /// Rewrite a message without touching the rest of the transcript.
    pub fn update_message(&self, chat_id: &str, message_id: &str, content: &str) -> bool {
        self.mutate(|data| {
            let chat = data.chat_mut(chat_id)?;
            let index = chat.position_of(message_id)?;
            let message = &mut chat.messages[index];
            message.content = content.to_owned();
            message.edited = true;
            chat.touch();
            Some(())
        })
        .is_some()
    }

    /// Rewrite a message, mark it edited and drop everything after it.
    pub fn edit_message_and_truncate(
        &self,
        chat_id: &str,
        message_id: &str,
        content: &str,
    ) -> Option<Message> {
        self.mutate(|data| {
            let chat = data.chat_mut(chat_id)?;
            let index = chat.position_of(message_id)?;
            let removed = chat.messages.len() - index - 1;
            chat.messages.truncate(index + 1);
            let edited = {
                let message = &mut chat.messages[index];
                message.content = content.to_owned();
                message.edited = true;
                message.clone()
            };
            chat.touch();
            debug!(chat_id, message_id, removed, "truncated chat after edit");
            Some(edited)
        })
    }

    /// Keep messages up to and including `message_id`; returns how many
    /// were removed.
    pub fn truncate_after(&self, chat_id: &str, message_id: &str) -> Option<usize> {
        self.mutate(|data| {
            let chat = data.chat_mut(chat_id)?;
            let index = chat.position_of(message_id)?;
            let removed = chat.messages.len() - index - 1;
            chat.messages.truncate(index + 1);
            chat.touch();
            debug!(chat_id, message_id, removed, "truncated chat");
            Some(removed)
        })
    }

    pub fn delete_chat(&self, chat_id: &str) -> bool {
        let deleted = self
            .mutate(|data| {
                let position = data.chats.iter().position(|c| c.id == chat_id)?;
                data.chats.remove(position);
                if data.current_chat_id.as_deref() == Some(chat_id) {
                    data.current_chat_id = data.chats.first().map(|c| c.id.clone());
                }
                Some(())
            })
            .is_some();
        if deleted {
            info!(chat_id, "deleted chat");
        }
        deleted
    }

    pub fn clear_all_chats(&self) {
        let mut data = self.data.write();
        data.chats.clear();
        data.current_chat_id = None;
        self.flush(&data);
    }

    pub fn settings(&self) -> Settings {
        self.data.read().settings.clone()
    }

    pub fn update_settings(&self, settings: Settings) -> bool {
        let mut data = self.data.write();
        data.settings = settings;
        self.flush(&data)
    }

    /// Serialize the snapshot into a pretty-printed backup document.
    pub fn export_backup(&self, user: &BackupUser) -> Result<String, StoreError> {
        let backup = BackupFile {
            export_date: Some(Utc::now()),
            user: Some(user.clone()),
            data: Some(self.get_all_data()),
        };
        Ok(serde_json::to_string_pretty(&backup)?)
    }

    /// Replace the snapshot with the contents of a backup document.
    ///
    /// The store keeps its own user id regardless of who exported the data.
    pub fn import_backup(&self, contents: &str) -> Result<(), StoreError> {
        let backup: BackupFile = serde_json::from_str(contents)
            .map_err(|err| StoreError::InvalidBackup(err.to_string()))?;
        let (Some(_user), Some(mut imported)) = (backup.user, backup.data) else {
            return Err(StoreError::InvalidBackup(
                "backup must contain `user` and `data`".to_string(),
            ));
        };
        imported.user_id = self.scope.user_id().map(str::to_owned);
        imported.repair_current();
        let mut data = self.data.write();
        write_snapshot(self.backend.as_ref(), &self.scope.storage_key(), &imported)?;
        info!(chats = imported.chats.len(), "imported chat backup");
        *data = imported;
        Ok(())
    }

    fn mutate<T>(&self, apply: impl FnOnce(&mut ChatData) -> Option<T>) -> Option<T> {
        let mut data = self.data.write();
        let outcome = apply(&mut data)?;
        self.flush(&data);
        Some(outcome)
    }

    fn flush(&self, data: &ChatData) -> bool {
        let key = self.scope.storage_key();
        match write_snapshot(self.backend.as_ref(), &key, data) {
            Ok(()) => true,
            Err(err) => {
                error!(%err, key, "failed to persist chat snapshot");
                false
            }
        }
    }
}

fn write_snapshot(
    backend: &dyn StorageBackend,
    key: &str,
    data: &ChatData,
) -> Result<(), StoreError> {
    let serialized = serde_json::to_string(data)?;
    backend.write(key, &serialized)
}

fn load_snapshot(backend: &dyn StorageBackend, scope: &StoreScope) -> ChatData {
    let key = scope.storage_key();
    match backend.read(&key) {
        Ok(Some(raw)) => match serde_json::from_str::<ChatData>(&raw) {
            Ok(mut data) => {
                if data.repair_current() {
                    warn!(key, "current chat pointer referenced a missing chat");
                }
                data
            }
            Err(err) => {
                warn!(%err, key, "corrupt chat snapshot, resetting to empty");
                initialize(backend, scope)
            }
        },
        Ok(None) => initialize(backend, scope),
        Err(err) => {
            warn!(%err, key, "failed to read chat snapshot, resetting to empty");
            initialize(backend, scope)
        }
    }
}

fn initialize(backend: &dyn StorageBackend, scope: &StoreScope) -> ChatData {
    let data = scope.empty_snapshot();
    let key = scope.storage_key();
    if let Err(err) = write_snapshot(backend, &key, &data) {
        error!(%err, key, "failed to write initial chat snapshot");
    }
    data
}
