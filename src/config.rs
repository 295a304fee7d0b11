use anyhow::{Context, Result, anyhow};
use std::env;
use std::time::Duration;

/// Device storage key holding the serialized offline queue.
pub const QUEUE_STORAGE_KEY: &str = "offline_pending_actions";
/// Device storage key holding the epoch-millisecond time of the last completed flush.
pub const LAST_SYNC_STORAGE_KEY: &str = "last_sync_time";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_FALLBACK_MESSAGE: &str =
    "抱歉，我暂时无法回答这个问题。消息已保存，网络恢复后会自动重试。";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Loads configuration into the environment.
///
/// `bundled` is the config file compiled into mobile builds, typically passed
/// as `include_str!("../assets/config.env")` by the embedding app.
#[cfg(not(target_arch = "wasm32"))]
pub fn load_dotenv(bundled: &str) {
    // First try to load from .env file (desktop dev)
    if dotenvy::dotenv().is_ok() {
        return;
    }
    load_bundled_config(bundled);
}

#[cfg(target_arch = "wasm32")]
pub fn load_dotenv(bundled: &str) {
    load_bundled_config(bundled);
}

/// Applies `KEY=VALUE` lines shipped with mobile builds without overriding
/// anything already present in the environment.
pub fn load_bundled_config(bundled: &str) {
    for line in bundled.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let value = value.trim();
            if env::var(key).is_err() {
                // SAFETY: called during startup before any worker threads exist
                unsafe {
                    env::set_var(key, value);
                }
            }
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(None),
    }
}

/// Offline queue behaviour.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncConfig {
    pub max_retries: u32,
    /// Pause between two replayed actions during a flush.
    pub retry_delay: Duration,
    pub queue_key: String,
    pub last_sync_key: String,
    pub fallback_message: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::ZERO,
            queue_key: QUEUE_STORAGE_KEY.to_string(),
            last_sync_key: LAST_SYNC_STORAGE_KEY.to_string(),
            fallback_message: DEFAULT_FALLBACK_MESSAGE.to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(max_retries) = parse_env::<u32>("NURTURE_MAX_RETRIES")? {
            if max_retries == 0 {
                return Err(anyhow!("NURTURE_MAX_RETRIES must be at least 1"));
            }
            config.max_retries = max_retries;
        }
        if let Some(delay_ms) = parse_env::<u64>("NURTURE_RETRY_DELAY_MS")? {
            config.retry_delay = Duration::from_millis(delay_ms);
        }
        if let Ok(message) = env::var("NURTURE_FALLBACK_MESSAGE")
            && !message.trim().is_empty()
        {
            config.fallback_message = message;
        }
        Ok(config)
    }
}

/// Where and how the HTTP transport reaches the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub request_timeout: Duration,
}

impl TransportConfig {
    pub fn from_env() -> Result<Self> {
        let base_url = env::var("NURTURE_API_BASE_URL")
            .context("NURTURE_API_BASE_URL is not set; point it at the chat backend")?;
        let api_token = env::var("NURTURE_API_TOKEN")
            .ok()
            .filter(|token| !token.is_empty());
        let timeout_secs = parse_env::<u64>("NURTURE_REQUEST_TIMEOUT_SECS")?
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
        Ok(Self {
            base_url,
            api_token,
            request_timeout: Duration::from_secs(timeout_secs),
        })
    }
}
