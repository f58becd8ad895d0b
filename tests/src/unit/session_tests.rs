use super::test_runtime;
use sooz_core::llm::{LlmDriver, MockProvider, MockReply, TransportError};
use sooz_core::session::{ChatSession, SessionContext, SessionOptions, ERROR_MARKER};
use sooz_core::state::MessageRole;
use sooz_core::store::{FileBackend, StorageBackend};
use sooz_core::stream::NoopObserver;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn quick_options() -> SessionOptions {
    SessionOptions {
        delete_grace: Duration::ZERO,
        credential_warning: None,
    }
}

fn open_session(dir: &TempDir, context: &SessionContext, llm: LlmDriver) -> ChatSession {
    let backend: Arc<dyn StorageBackend> = Arc::new(FileBackend::new(dir.path().to_path_buf()));
    ChatSession::open(context, backend, llm, quick_options())
}

#[test]
fn conversation_survives_reopen() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let context = SessionContext::for_user("u1");
    let provider = Arc::new(
        MockProvider::echo()
            .with_streams([MockReply::fragments(["Hi", " there"])])
            .with_completions([MockReply::fragments(["Friendly Greeting"])]),
    );
    let session = open_session(&temp_dir, &context, LlmDriver::with_mock(provider));

    let outcome = runtime
        .block_on(session.send_message("Hello", &mut NoopObserver))
        .expect("send")
        .expect("outcome");
    runtime
        .block_on(outcome.title_task.expect("title task"))
        .expect("title task joined");

    assert!(temp_dir.path().join("soozai_user_data_u1.json").exists());

    let reopened = open_session(&temp_dir, &context, LlmDriver::fake());
    let chat = reopened.current_chat().expect("current chat restored");
    assert_eq!(chat.id, outcome.reply.chat_id);
    assert_eq!(chat.title.as_deref(), Some("Friendly Greeting"));
    let turns: Vec<_> = chat
        .messages
        .iter()
        .map(|m| (m.role, m.content.clone()))
        .collect();
    assert_eq!(
        turns,
        vec![
            (MessageRole::User, "Hello".to_string()),
            (MessageRole::Assistant, "Hi there".to_string())
        ]
    );
}

#[test]
fn users_do_not_see_each_others_chats() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let alice = open_session(&temp_dir, &SessionContext::for_user("alice"), LlmDriver::fake());
    let bob = open_session(&temp_dir, &SessionContext::for_user("bob"), LlmDriver::fake());
    let global = open_session(&temp_dir, &SessionContext::global(), LlmDriver::fake());

    runtime
        .block_on(alice.send_message("alice only", &mut NoopObserver))
        .expect("send");

    assert_eq!(alice.list_chats().len(), 1);
    assert!(bob.list_chats().is_empty());
    assert!(global.list_chats().is_empty());
    assert_eq!(alice.snapshot().user_id.as_deref(), Some("alice"));
    assert!(global.snapshot().user_id.is_none());
    assert!(temp_dir.path().join("soozai_chat_data.json").exists());
}

#[test]
fn failed_reply_is_persisted_with_marker() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let failure = TransportError::Request("connection refused".into());
    let provider = Arc::new(MockProvider::echo().with_streams([
        MockReply::Fail(failure.clone()),
        MockReply::Fail(failure.clone()),
        MockReply::Fail(failure),
    ]));
    let context = SessionContext::global();
    let session = open_session(&temp_dir, &context, LlmDriver::with_mock(provider));

    let outcome = runtime
        .block_on(session.send_message("is anyone there", &mut NoopObserver))
        .expect("send")
        .expect("outcome");
    assert!(outcome.reply.error.is_some());

    let reopened = open_session(&temp_dir, &context, LlmDriver::fake());
    let chat = reopened.current_chat().expect("chat");
    let reply = chat.last_message().expect("reply");
    assert_eq!(reply.role, MessageRole::Assistant);
    assert!(reply.content.starts_with(ERROR_MARKER));
    assert!(reply.content.contains("connection refused"));
}

#[test]
fn edit_then_delete_round_trip() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let session = open_session(&temp_dir, &SessionContext::for_user("u1"), LlmDriver::fake());

    let first = runtime
        .block_on(session.send_message("first question", &mut NoopObserver))
        .expect("send")
        .expect("outcome");
    runtime
        .block_on(session.send_message("second question", &mut NoopObserver))
        .expect("send");
    assert_eq!(session.current_chat().expect("chat").messages.len(), 4);

    let reply = runtime
        .block_on(session.edit_message(&first.user_message.id, "better question", &mut NoopObserver))
        .expect("edit")
        .expect("reply");
    let chat = session.get_chat(&reply.chat_id).expect("chat");
    assert_eq!(chat.messages.len(), 2);
    assert_eq!(chat.messages[1].content, "[Mock] mock: received 'better question'.");

    let second_chat = session.create_chat();
    assert!(session.select_chat(&chat.id));
    assert!(runtime.block_on(session.delete_chat(&chat.id)));
    assert_eq!(session.current_chat().map(|c| c.id), Some(second_chat.id));
    assert!(!runtime.block_on(session.delete_chat("missing")));
}

#[test]
fn missing_credentials_become_a_warning() {
    let temp_dir = TempDir::new().expect("temp dir");
    let mut settings = sooz_core::config::ProviderSettings::default();
    settings.data_dir = Some(temp_dir.path().to_path_buf());

    let session = ChatSession::from_settings(&SessionContext::global(), &settings)
        .expect("session builds without a key");
    let warning = session.credential_warning().expect("warning");
    assert!(warning.contains(sooz_core::config::API_KEY_ENV));

    settings.apply_key_override(Some("sk-or-v1-0123456789".into()));
    let session = ChatSession::from_settings(&SessionContext::global(), &settings).expect("session");
    assert!(session.credential_warning().is_none());
}
