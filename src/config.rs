use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::platform::telegram::ParseMode;
use crate::template::DEFAULT_TEMPLATE;

pub const DEFAULT_TEMPLATE_PATH: &str = "./template_default.tmpl";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("not all required settings are present, missing: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub gotify: GotifyConfig,
    pub telegram: TelegramConfig,
    pub template: TemplateConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone)]
pub struct GotifyConfig {
    pub host: String,
    pub client_token: String,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub chat_id: String,
    pub bot_token: String,
    pub api_url: String,
    pub parse_mode: ParseMode,
    pub send_timeout_secs: u64,
    /// Log rendered messages instead of sending them
    pub dry_run: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TemplateConfig {
    #[serde(default = "default_template_path")]
    pub path: PathBuf,
    /// Re-read the template for every message (hot reload)
    #[serde(default = "default_true")]
    pub reload: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    /// Fixed delay between connection attempts, in milliseconds
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// How often the forwarder checks for a connection handle, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl StreamConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// On-disk layout. Every value is optional here; the environment may fill in the rest.
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    gotify: FileGotify,
    #[serde(default)]
    telegram: FileTelegram,
    #[serde(default = "default_template_config")]
    template: TemplateConfig,
    #[serde(default = "default_stream_config")]
    stream: StreamConfig,
}

#[derive(Debug, Deserialize, Default)]
struct FileGotify {
    host: Option<String>,
    client_token: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FileTelegram {
    chat_id: Option<ChatId>,
    bot_token: Option<String>,
    api_url: Option<String>,
    parse_mode: Option<ParseMode>,
    send_timeout_secs: Option<u64>,
    dry_run: Option<bool>,
}

/// Chat ids are numeric in Telegram but may be written either way in TOML
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChatId {
    Number(i64),
    Text(String),
}

impl From<ChatId> for String {
    fn from(id: ChatId) -> Self {
        match id {
            ChatId::Number(n) => n.to_string(),
            ChatId::Text(s) => s,
        }
    }
}

fn default_template_path() -> PathBuf {
    PathBuf::from(DEFAULT_TEMPLATE_PATH)
}

fn default_true() -> bool {
    true
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

fn default_poll_interval_ms() -> u64 {
    3000
}

fn default_api_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_send_timeout_secs() -> u64 {
    10
}

fn default_template_config() -> TemplateConfig {
    TemplateConfig {
        path: default_template_path(),
        reload: default_true(),
    }
}

fn default_stream_config() -> StreamConfig {
    StreamConfig {
        reconnect_delay_ms: default_reconnect_delay_ms(),
        poll_interval_ms: default_poll_interval_ms(),
    }
}

impl Default for TemplateConfig {
    fn default() -> Self {
        default_template_config()
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        default_stream_config()
    }
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn required(key: &'static str, value: Option<String>, missing: &mut Vec<&'static str>) -> String {
    match value.filter(|v| !v.trim().is_empty()) {
        Some(v) => v,
        None => {
            error!("Env {} not set", key);
            missing.push(key);
            String::new()
        }
    }
}

fn parse_value<T: FromStr>(key: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError> {
    value
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value: v })
        })
        .transpose()
}

fn parse_flag(key: &'static str, value: Option<String>) -> Result<Option<bool>, ConfigError> {
    value
        .map(|v| match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { key, value: v }),
        })
        .transpose()
}

impl Config {
    /// Load from an optional TOML file, with process environment variables on top
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::resolve(path, |key| std::env::var(key).ok())
    }

    /// Build the configuration from an optional TOML file and an environment lookup.
    ///
    /// Environment values win over the file. All four connection settings
    /// must be present; every missing one is reported before failing.
    pub fn resolve(
        path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => FileConfig::read(path)?,
            None => FileConfig::default(),
        };
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let mut missing = Vec::new();
        let host = required(
            "GOTIFY_HOST",
            env("GOTIFY_HOST").or(file.gotify.host),
            &mut missing,
        );
        let client_token = required(
            "GOTIFY_CLIENT_TOKEN",
            env("GOTIFY_CLIENT_TOKEN").or(file.gotify.client_token),
            &mut missing,
        );
        let chat_id = required(
            "TELEGRAM_CHAT_ID",
            env("TELEGRAM_CHAT_ID").or(file.telegram.chat_id.map(String::from)),
            &mut missing,
        );
        let bot_token = required(
            "TELEGRAM_BOT_TOKEN",
            env("TELEGRAM_BOT_TOKEN").or(file.telegram.bot_token),
            &mut missing,
        );
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let telegram = TelegramConfig {
            chat_id,
            bot_token,
            api_url: env("TELEGRAM_API_URL")
                .or(file.telegram.api_url)
                .unwrap_or_else(default_api_url),
            parse_mode: parse_value("TELEGRAM_PARSE_MODE", env("TELEGRAM_PARSE_MODE"))?
                .or(file.telegram.parse_mode)
                .unwrap_or_default(),
            send_timeout_secs: file
                .telegram
                .send_timeout_secs
                .unwrap_or_else(default_send_timeout_secs),
            dry_run: parse_flag("DRY_RUN", env("DRY_RUN"))?
                .or(file.telegram.dry_run)
                .unwrap_or(false),
        };

        let mut template = file.template;
        if let Some(path) = env("TEMPLATE_PATH") {
            template.path = PathBuf::from(path);
        }
        if let Some(reload) = parse_flag("TEMPLATE_RELOAD", env("TEMPLATE_RELOAD"))? {
            template.reload = reload;
        }

        let mut stream = file.stream;
        if let Some(delay) = parse_value("RECONNECT_DELAY_MS", env("RECONNECT_DELAY_MS"))? {
            stream.reconnect_delay_ms = delay;
        }
        if stream.reconnect_delay_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "stream.reconnect_delay_ms",
                value: "0".to_string(),
            });
        }
        if stream.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "stream.poll_interval_ms",
                value: "0".to_string(),
            });
        }

        template.path = materialize_template(&template.path, Path::new(DEFAULT_TEMPLATE_PATH));

        Ok(Config {
            gotify: GotifyConfig { host, client_token },
            telegram,
            template,
            stream,
        })
    }
}

/// Return a template path that exists.
///
/// A missing `path` falls back to `fallback`, which is created with the
/// default template if it does not exist either. Write failures are logged
/// and rendering will degrade to empty messages.
pub fn materialize_template(path: &Path, fallback: &Path) -> PathBuf {
    if path.exists() {
        return path.to_path_buf();
    }
    if path != fallback {
        warn!(
            "Template file {} not found, falling back to {}",
            path.display(),
            fallback.display()
        );
    }
    if !fallback.exists() {
        info!("Generating default template into file {}", fallback.display());
        if let Err(e) = std::fs::write(fallback, DEFAULT_TEMPLATE) {
            error!(
                "Error while writing default template file {}: {}",
                fallback.display(),
                e
            );
        }
    }
    fallback.to_path_buf()
}
