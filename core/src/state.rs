use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Opaque identifier shared by chats and messages.
pub type ChatId = String;
pub type MessageId = String;

/// Generate an opaque `<unix-millis>-<base36>` identifier.
pub fn generate_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let mut entropy = u128::from_le_bytes(*Uuid::new_v4().as_bytes());
    let mut suffix = String::with_capacity(9);
    for _ in 0..9 {
        let digit = (entropy % 36) as u32;
        suffix.push(char::from_digit(digit, 36).unwrap_or('0'));
        entropy /= 36;
    }
    format!("{millis}-{suffix}")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Reference to an image produced by an image-capable model.
///
/// Providers disagree on the exact shape, so the raw JSON is kept and the
/// URL is resolved on demand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ImageRef(pub Value);

impl ImageRef {
    pub fn url(&self) -> Option<&str> {
        self.0
            .pointer("/image_url/url")
            .or_else(|| self.0.get("url"))
            .and_then(Value::as_str)
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub edited: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageRef>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            edited: false,
            images: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    #[serde(default)]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tool_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl Chat {
    pub fn new(title: Option<String>, tool_id: Option<String>, model: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id(),
            title,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            tool_id,
            model,
        }
    }

    /// Model identifier for this chat, or `default` when none was recorded.
    pub fn model_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.model
            .as_deref()
            .filter(|model| !model.trim().is_empty())
            .unwrap_or(default)
    }

    pub fn position_of(&self, message_id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == message_id)
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Push a message and move `updated_at` forward to its timestamp.
    pub(crate) fn push(&mut self, message: Message) -> &Message {
        self.touch_at(message.timestamp);
        self.messages.push(message);
        &self.messages[self.messages.len() - 1]
    }

    pub(crate) fn touch(&mut self) {
        self.touch_at(Utc::now());
    }

    fn touch_at(&mut self, at: DateTime<Utc>) {
        if at > self.updated_at {
            self.updated_at = at;
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Dark,
    Light,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub theme: Theme,
    #[serde(default = "Settings::default_streaming")]
    pub streaming_enabled: bool,
}

impl Settings {
    fn default_streaming() -> bool {
        true
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            theme: Theme::Dark,
            streaming_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default)]
    pub preferences: Map<String, Value>,
    pub last_active: DateTime<Utc>,
}

/// Full persisted snapshot for one store scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChatData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub chats: Vec<Chat>,
    #[serde(default)]
    pub current_chat_id: Option<ChatId>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
}

impl ChatData {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            profile: Some(Profile {
                preferences: Map::new(),
                last_active: Utc::now(),
            }),
            ..Self::default()
        }
    }

    pub fn chat(&self, id: &str) -> Option<&Chat> {
        self.chats.iter().find(|c| c.id == id)
    }

    pub fn chat_mut(&mut self, id: &str) -> Option<&mut Chat> {
        self.chats.iter_mut().find(|c| c.id == id)
    }

    /// Drop a current pointer that no longer references a stored chat.
    pub(crate) fn repair_current(&mut self) -> bool {
        match &self.current_chat_id {
            Some(id) if self.chat(id).is_none() => {
                self.current_chat_id = None;
                true
            }
            _ => false,
        }
    }
}

/// Sidebar-sized view of a chat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatSummary {
    pub id: ChatId,
    pub title: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

impl From<&Chat> for ChatSummary {
    fn from(chat: &Chat) -> Self {
        Self {
            id: chat.id.clone(),
            title: chat.title.clone(),
            updated_at: chat.updated_at,
            message_count: chat.messages.len(),
        }
    }
}

/// Preset that seeds a new chat with a tool tag and model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChatPreset {
    pub tool_id: Option<String>,
    pub model: Option<String>,
}
