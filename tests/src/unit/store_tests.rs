use sooz_core::state::{ChatData, MessageRole, Theme};
use sooz_core::store::{
    BackupUser, ChatStore, FileBackend, MemoryBackend, StorageBackend, StoreError, StoreScope,
};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

fn file_store(dir: &TempDir, scope: StoreScope) -> ChatStore {
    let backend: Arc<dyn StorageBackend> = Arc::new(FileBackend::new(dir.path().to_path_buf()));
    ChatStore::open(backend, scope)
}

#[test]
fn snapshot_file_uses_camel_case_layout() {
    let temp_dir = TempDir::new().expect("temp dir");
    let store = file_store(&temp_dir, StoreScope::User("u7".into()));
    let chat = store.create_chat(None, Some("image".into()), Some("some/model".into()));
    store.append_message(&chat.id, MessageRole::User, "draw a cat");

    let raw = fs::read_to_string(temp_dir.path().join("soozai_user_data_u7.json")).expect("file");
    let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
    assert_eq!(value["userId"], "u7");
    assert_eq!(value["currentChatId"], chat.id.as_str());
    assert_eq!(value["chats"][0]["toolId"], "image");
    assert_eq!(value["chats"][0]["messages"][0]["role"], "user");
    assert_eq!(value["settings"]["streamingEnabled"], true);
    assert!(value["profile"]["lastActive"].is_string());
    assert!(!temp_dir.path().join("soozai_user_data_u7.json.tmp").exists());
}

#[test]
fn corrupt_snapshot_resets_to_empty() {
    let temp_dir = TempDir::new().expect("temp dir");
    fs::write(temp_dir.path().join("soozai_chat_data.json"), "{not json").expect("seed");

    let store = file_store(&temp_dir, StoreScope::Global);
    assert!(store.list_chats().is_empty());
    assert_eq!(store.get_all_data(), ChatData::default());

    let raw = fs::read_to_string(temp_dir.path().join("soozai_chat_data.json")).expect("file");
    assert!(serde_json::from_str::<ChatData>(&raw).is_ok());
}

#[test]
fn quota_failure_keeps_in_memory_change() {
    let backend = Arc::new(MemoryBackend::with_quota(512));
    let shared: Arc<dyn StorageBackend> = backend.clone();
    let store = ChatStore::open(shared, StoreScope::Global);
    let chat = store.create_chat(None, None, None);

    let long = "x".repeat(2048);
    let message = store
        .append_message(&chat.id, MessageRole::User, long.clone())
        .expect("appended in memory");

    assert_eq!(store.get_chat(&chat.id).expect("chat").messages[0].id, message.id);
    let persisted = backend.raw("soozai_chat_data").unwrap_or_default();
    assert!(!persisted.contains(&long));

    let err = backend
        .write("soozai_chat_data", &long)
        .expect_err("quota enforced");
    assert!(matches!(err, StoreError::QuotaExceeded { .. }));
}

#[test]
fn backup_moves_chats_between_users() {
    let temp_dir = TempDir::new().expect("temp dir");
    let source = file_store(&temp_dir, StoreScope::User("old".into()));
    let chat = source.create_chat(Some("Trip".into()), None, None);
    source.append_message(&chat.id, MessageRole::User, "pack list?");
    let mut settings = source.settings();
    settings.theme = Theme::Light;
    source.update_settings(settings);

    let exported = source
        .export_backup(&BackupUser {
            id: "old".into(),
            email: Some("old@example.com".into()),
            name: None,
            provider: Some("email".into()),
        })
        .expect("export");
    let document: serde_json::Value = serde_json::from_str(&exported).expect("json");
    assert!(document["exportDate"].is_string());
    assert_eq!(document["user"]["email"], "old@example.com");

    let target = file_store(&temp_dir, StoreScope::User("new".into()));
    target.import_backup(&exported).expect("import");

    let imported = target.get_all_data();
    assert_eq!(imported.user_id.as_deref(), Some("new"));
    assert_eq!(imported.chats.len(), 1);
    assert_eq!(imported.chats[0].title.as_deref(), Some("Trip"));
    assert_eq!(imported.settings.theme, Theme::Light);

    let reopened = file_store(&temp_dir, StoreScope::User("new".into()));
    assert_eq!(reopened.get_all_data(), imported);
}

#[test]
fn malformed_backup_is_rejected_without_changes() {
    let store = ChatStore::in_memory();
    let chat = store.create_chat(None, None, None);

    let err = store.import_backup("{\"data\": {}}").expect_err("user required");
    assert!(matches!(err, StoreError::InvalidBackup(_)));
    let err = store.import_backup("not a backup").expect_err("json required");
    assert!(matches!(err, StoreError::InvalidBackup(_)));
    assert_eq!(store.current_id(), Some(chat.id));
}

#[test]
fn clear_all_chats_keeps_settings() {
    let temp_dir = TempDir::new().expect("temp dir");
    let store = file_store(&temp_dir, StoreScope::Global);
    store.create_chat(None, None, None);
    let mut settings = store.settings();
    settings.streaming_enabled = false;
    store.update_settings(settings.clone());

    store.clear_all_chats();

    let reopened = file_store(&temp_dir, StoreScope::Global);
    assert!(reopened.list_chats().is_empty());
    assert!(reopened.current_id().is_none());
    assert_eq!(reopened.settings(), settings);
}
