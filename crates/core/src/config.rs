use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_SLACK_API_BASE_URL: &str = "https://slack.com/api";
pub const DEFAULT_SHORTCUT_CALLBACK_ID: &str = "count";
pub const DEFAULT_EVENTS_PATH: &str = "/slack/events";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub slack: SlackConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct SlackConfig {
    pub bot_token: SecretString,
    pub signing_secret: SecretString,
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub shortcut_callback_id: String,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub events_path: String,
    pub signature_max_age_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub request_dump: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub port: Option<u16>,
    pub slack_bot_token: Option<String>,
    pub slack_signing_secret: Option<String>,
    pub slack_api_base_url: Option<String>,
    pub request_dump: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    /// Read a `.env` file before consulting the environment. Its values replace
    /// variables that are already set.
    pub load_dotenv: bool,
    /// Where to find the `.env` file. Defaults to searching from the working directory.
    pub dotenv_path: Option<PathBuf>,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("could not load .env file: {0}")]
    Dotenv(#[source] dotenvy::Error),
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            slack: SlackConfig {
                bot_token: String::new().into(),
                signing_secret: String::new().into(),
                api_base_url: DEFAULT_SLACK_API_BASE_URL.to_string(),
                request_timeout_secs: 30,
                shortcut_callback_id: DEFAULT_SHORTCUT_CALLBACK_ID.to_string(),
            },
            server: ServerConfig {
                bind_address: "0.0.0.0".to_string(),
                port: 3000,
                events_path: DEFAULT_EVENTS_PATH.to_string(),
                signature_max_age_secs: 300,
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                format: LogFormat::Compact,
                request_dump: false,
            },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        if options.load_dotenv {
            load_dotenv(options.dotenv_path.as_deref())?;
        }

        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("tally.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.bind_address, self.server.port)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(slack) = patch.slack {
            if let Some(bot_token) = slack.bot_token {
                self.slack.bot_token = secret_value(bot_token);
            }
            if let Some(signing_secret) = slack.signing_secret {
                self.slack.signing_secret = secret_value(signing_secret);
            }
            if let Some(api_base_url) = slack.api_base_url {
                self.slack.api_base_url = api_base_url;
            }
            if let Some(request_timeout_secs) = slack.request_timeout_secs {
                self.slack.request_timeout_secs = request_timeout_secs;
            }
            if let Some(shortcut_callback_id) = slack.shortcut_callback_id {
                self.slack.shortcut_callback_id = shortcut_callback_id;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(events_path) = server.events_path {
                self.server.events_path = events_path;
            }
            if let Some(signature_max_age_secs) = server.signature_max_age_secs {
                self.server.signature_max_age_secs = signature_max_age_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
            if let Some(request_dump) = logging.request_dump {
                self.logging.request_dump = request_dump;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env_any(&["TALLY_SLACK_BOT_TOKEN", "SLACK_BOT_TOKEN"]) {
            self.slack.bot_token = secret_value(value);
        }
        if let Some(value) = read_env_any(&["TALLY_SLACK_SIGNING_SECRET", "SLACK_SIGNING_SECRET"])
        {
            self.slack.signing_secret = secret_value(value);
        }
        if let Some(value) = read_env("TALLY_SLACK_API_BASE_URL") {
            self.slack.api_base_url = value;
        }
        if let Some(value) = read_env("TALLY_SLACK_REQUEST_TIMEOUT_SECS") {
            self.slack.request_timeout_secs =
                parse_u64("TALLY_SLACK_REQUEST_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("TALLY_SLACK_SHORTCUT_CALLBACK_ID") {
            self.slack.shortcut_callback_id = value;
        }

        if let Some(value) = read_env("TALLY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some((key, value)) = read_env_keyed(&["TALLY_SERVER_PORT", "PORT"]) {
            self.server.port = parse_u16(key, &value)?;
        }
        if let Some(value) = read_env("TALLY_SERVER_EVENTS_PATH") {
            self.server.events_path = value;
        }
        if let Some(value) = read_env("TALLY_SERVER_SIGNATURE_MAX_AGE_SECS") {
            self.server.signature_max_age_secs =
                parse_u64("TALLY_SERVER_SIGNATURE_MAX_AGE_SECS", &value)?;
        }

        if let Some(value) = read_env_any(&["TALLY_LOG_LEVEL", "SLACK_LOG_LEVEL"]) {
            self.logging.level = value;
        }
        if let Some(value) = read_env("TALLY_LOG_FORMAT") {
            self.logging.format = value.parse()?;
        }
        if let Some((key, value)) =
            read_env_keyed(&["TALLY_REQUEST_LOG_ENABLED", "SLACK_REQUEST_LOG_ENABLED"])
        {
            self.logging.request_dump = parse_flag(key, &value)?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(bot_token) = overrides.slack_bot_token {
            self.slack.bot_token = secret_value(bot_token);
        }
        if let Some(signing_secret) = overrides.slack_signing_secret {
            self.slack.signing_secret = secret_value(signing_secret);
        }
        if let Some(api_base_url) = overrides.slack_api_base_url {
            self.slack.api_base_url = api_base_url;
        }
        if let Some(request_dump) = overrides.request_dump {
            self.logging.request_dump = request_dump;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_slack(&self.slack)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("tally.toml"), PathBuf::from("config/tally.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_slack(slack: &SlackConfig) -> Result<(), ConfigError> {
    let bot_token = slack.bot_token.expose_secret();
    if bot_token.is_empty() {
        return Err(ConfigError::Validation(
            "slack.bot_token is required. Get it from https://api.slack.com/apps > Your App > OAuth & Permissions > Bot User OAuth Token".to_string()
        ));
    }
    if !bot_token.starts_with("xoxb-") {
        let hint = if bot_token.starts_with("xoxp-") {
            " (hint: you may have used a user token instead of the bot token)"
        } else {
            ""
        };
        return Err(ConfigError::Validation(format!(
            "slack.bot_token must start with `xoxb-`{hint}. Get it from https://api.slack.com/apps"
        )));
    }

    if slack.signing_secret.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "slack.signing_secret is required. Get it from https://api.slack.com/apps > Your App > Basic Information > Signing Secret".to_string()
        ));
    }

    let base_url = slack.api_base_url.trim();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "slack.api_base_url must start with http:// or https://".to_string(),
        ));
    }

    if slack.request_timeout_secs == 0 || slack.request_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "slack.request_timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if slack.shortcut_callback_id.trim().is_empty() {
        return Err(ConfigError::Validation(
            "slack.shortcut_callback_id must not be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if !server.events_path.starts_with('/') || server.events_path == "/" {
        return Err(ConfigError::Validation(
            "server.events_path must start with `/` and must not be the root path".to_string(),
        ));
    }

    if server.signature_max_age_secs == 0 {
        return Err(ConfigError::Validation(
            "server.signature_max_age_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn load_dotenv(path: Option<&Path>) -> Result<(), ConfigError> {
    let loaded = match path {
        Some(path) => dotenvy::from_path_override(path),
        None => dotenvy::dotenv_override().map(|_| ()),
    };

    match loaded {
        // A missing .env is the normal case in deployed environments.
        Err(error) if error.not_found() => Ok(()),
        Err(error) => Err(ConfigError::Dotenv(error)),
        Ok(()) => Ok(()),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_env_any(keys: &[&str]) -> Option<String> {
    read_env_keyed(keys).map(|(_, value)| value)
}

fn read_env_keyed<'a>(keys: &[&'a str]) -> Option<(&'a str, String)> {
    keys.iter().find_map(|key| read_env(key).map(|value| (*key, value)))
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnvOverride {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    slack: Option<SlackPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct SlackPatch {
    bot_token: Option<String>,
    signing_secret: Option<String>,
    api_base_url: Option<String>,
    request_timeout_secs: Option<u64>,
    shortcut_callback_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    events_path: Option<String>,
    signature_max_age_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
    request_dump: Option<bool>,
}
