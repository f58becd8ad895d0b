pub mod config;
pub mod llm;
pub mod session;
pub mod state;
pub mod store;
pub mod stream;
pub mod telemetry;
pub mod title;


pub use config::{ConfigError, ProviderSettings};
pub use llm::{CompletionProvider, LlmDriver, LlmProviderKind, MockProvider, MockReply, TransportError};
pub use session::{ChatSession, SessionContext, SessionError, SessionEvent, SessionOptions};
pub use state::{Chat, ChatData, ChatPreset, Message, MessageRole, Settings};
pub use store::{ChatStore, FileBackend, MemoryBackend, StorageBackend, StoreError, StoreScope};
pub use stream::{StreamEvent, StreamObserver};
