use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use sooz_core::session::{ChatSession, SessionContext, SessionOptions};
use sooz_core::store::{FileBackend, StorageBackend};
use sooz_core::stream::NoopObserver;
use sooz_core::{config::ProviderSettings, llm::LlmDriver, telemetry};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for Sooz")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive a full send, edit, regenerate and delete cycle against the mock provider.
    Smoke,
    /// Load sooz.yaml and the environment and report whether a provider key is usable.
    CheckConfig,
}

fn main() -> Result<()> {
    telemetry::init_from_env()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Smoke => smoke_test(),
        Commands::CheckConfig => check_config(),
    }
}

fn smoke_test() -> Result<()> {
    let runtime = Runtime::new()?;
    let temp_dir = TempDir::new()?;
    let backend: Arc<dyn StorageBackend> = Arc::new(FileBackend::new(temp_dir.path().to_path_buf()));
    let options = SessionOptions {
        delete_grace: Duration::ZERO,
        ..SessionOptions::default()
    };
    let session = ChatSession::open(
        &SessionContext::for_user("xtask"),
        backend,
        LlmDriver::fake(),
        options,
    );

    runtime.block_on(async {
        let sent = session
            .send_message("ping from xtask", &mut NoopObserver)
            .await?
            .ok_or_else(|| anyhow!("send produced no reply"))?;
        if let Some(task) = sent.title_task {
            task.await?;
        }

        session
            .edit_message(&sent.user_message.id, "edited ping from xtask", &mut NoopObserver)
            .await?
            .ok_or_else(|| anyhow!("edit produced no reply"))?;
        let chat = session
            .current_chat()
            .ok_or_else(|| anyhow!("no current chat after edit"))?;
        let reply_id = chat
            .last_message()
            .map(|message| message.id.clone())
            .ok_or_else(|| anyhow!("chat has no reply"))?;
        session
            .regenerate(&reply_id, &mut NoopObserver)
            .await?
            .ok_or_else(|| anyhow!("regenerate produced no reply"))?;

        if let Some(chat) = session.current_chat() {
            info!(
                "title" = chat.title.as_deref().unwrap_or_default(),
                "messages" = chat.messages.len(),
                "smoke test conversation saved"
            );
        }
        if !session.delete_chat(&chat.id).await {
            return Err(anyhow!("chat {} could not be deleted", chat.id));
        }
        Ok::<_, anyhow::Error>(())
    })?;

    info!("chats" = session.list_chats().len(), "smoke test finished");
    Ok(())
}

fn check_config() -> Result<()> {
    let settings = ProviderSettings::load()?;
    info!(
        provider = ?settings.provider,
        model = %settings.open_router.model,
        endpoint = %settings.open_router.endpoint,
        "provider settings loaded"
    );
    match settings.credential_status() {
        Ok(()) => info!("provider credential present"),
        Err(err) => warn!("{}", err.user_message()),
    }
    Ok(())
}
