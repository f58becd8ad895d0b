use crate::llm::{LlmProviderKind, RetryPolicy, DEFAULT_ENDPOINT, DEFAULT_MODEL};
use directories::BaseDirs;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides the configured provider key.
pub const API_KEY_ENV: &str = "SOOZ_OPENROUTER_KEY";

const MIN_KEY_LEN: usize = 10;

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub provider: LlmProviderKind,
    pub open_router: OpenRouterSettings,
    pub retry: RetryPolicy,
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct OpenRouterSettings {
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
    pub referer: Option<String>,
    pub app_title: Option<String>,
}

impl Default for OpenRouterSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            referer: None,
            app_title: Some("SoozAI".to_string()),
        }
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider: LlmProviderKind::OpenRouter,
            open_router: OpenRouterSettings::default(),
            retry: RetryPolicy::default(),
            data_dir: None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("provider key missing: set SOOZ_OPENROUTER_KEY or add open_router.api_key to sooz.yaml")]
    MissingCredential,
    #[error("configuration invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Text for the standing warning shown while the key is missing.
    pub fn user_message(&self) -> String {
        match self {
            Self::MissingCredential => {
                format!("OpenRouter API key missing! Add {API_KEY_ENV}=or_xxxxx to your .env")
            }
            Self::Invalid(detail) => format!("Configuration problem: {detail}. Update sooz.yaml."),
        }
    }
}

impl ProviderSettings {
    /// Load `sooz.yaml` (if any), then apply `.env` and the key override.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut settings = match locate_config_file() {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        settings.apply_key_override(std::env::var(API_KEY_ENV).ok());
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            ConfigError::Invalid(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: SoozConfig = serde_yaml::from_str(contents)
            .map_err(|err| ConfigError::Invalid(format!("invalid sooz.yaml: {err}")))?;
        let app = config
            .app
            .ok_or_else(|| ConfigError::Invalid("missing `app` section".to_string()))?;
        resolve_app_settings(app)
    }

    pub fn apply_key_override(&mut self, key: Option<String>) {
        if let Some(key) = key {
            let key = sanitize_key(&key);
            if !key.is_empty() {
                self.open_router.api_key = key;
            }
        }
    }

    /// The mock provider needs no key; OpenRouter needs one longer than
    /// ten characters.
    pub fn credential_status(&self) -> Result<(), ConfigError> {
        match self.provider {
            LlmProviderKind::Mock => Ok(()),
            LlmProviderKind::OpenRouter if self.open_router.api_key.len() > MIN_KEY_LEN => Ok(()),
            LlmProviderKind::OpenRouter => Err(ConfigError::MissingCredential),
        }
    }
}

/// Strip quotes and every whitespace character from a pasted key.
pub fn sanitize_key(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != '"' && !c.is_whitespace())
        .collect()
}

fn resolve_app_settings(app: AppSection) -> Result<ProviderSettings, ConfigError> {
    let provider = app.provider.unwrap_or_default();
    let defaults = OpenRouterSettings::default();
    let section = app.open_router.unwrap_or_default();

    let endpoint = section
        .endpoint
        .map(|e| e.trim().to_string())
        .unwrap_or(defaults.endpoint);
    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        return Err(ConfigError::Invalid(format!(
            "endpoint must be an http(s) URL, got `{endpoint}`"
        )));
    }
    let model = section
        .model
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .unwrap_or(defaults.model);

    let retry_section = app.retry.unwrap_or_default();
    let default_retry = RetryPolicy::default();
    let retry = RetryPolicy {
        max_retries: retry_section.max_retries.unwrap_or(default_retry.max_retries),
        delay: retry_section
            .delay_ms
            .map(Duration::from_millis)
            .unwrap_or(default_retry.delay),
    };

    Ok(ProviderSettings {
        provider,
        open_router: OpenRouterSettings {
            api_key: sanitize_key(&section.api_key),
            endpoint,
            model,
            referer: section.referer.or(defaults.referer),
            app_title: section.title.or(defaults.app_title),
        },
        retry,
        data_dir: app.data_dir,
    })
}

fn locate_config_file() -> Option<PathBuf> {
    sooz_yaml_candidates()
        .into_iter()
        .find(|path| path.exists())
}

fn sooz_yaml_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("sooz");
        paths.push(config_dir.join("sooz.yaml"));
        paths.push(config_dir.join("sooz.yml"));
        let home_dir = base.home_dir();
        paths.push(home_dir.join(".sooz").join("sooz.yaml"));
        paths.push(home_dir.join(".sooz").join("sooz.yml"));
    } else {
        paths.push(PathBuf::from("sooz.yaml"));
        paths.push(PathBuf::from("sooz.yml"));
    }
    paths
}

#[derive(Debug, Deserialize)]
struct SoozConfig {
    app: Option<AppSection>,
}

#[derive(Debug, Deserialize)]
struct AppSection {
    provider: Option<LlmProviderKind>,
    open_router: Option<OpenRouterSection>,
    retry: Option<RetrySection>,
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenRouterSection {
    #[serde(default)]
    api_key: String,
    endpoint: Option<String>,
    model: Option<String>,
    referer: Option<String>,
    title: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RetrySection {
    max_retries: Option<u32>,
    delay_ms: Option<u64>,
}
