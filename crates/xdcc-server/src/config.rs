//! Environment-variable configuration, loaded once at startup.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub file_destination: std::path::PathBuf,
    pub irc_server: String,
    pub irc_nick: String,
    pub irc_channel: String,
    pub irc_nickserv_password: Option<String>,
    pub progress_interval: Duration,
    pub progress_update_percent: u8,
    pub log_file: Option<std::path::PathBuf>,
    pub debug: bool,
    pub disable_progress_ansi: bool,
    pub reject_private_ip: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} is set to {value:?}, which is not a valid {kind}")]
    Invalid {
        name: &'static str,
        value: String,
        kind: &'static str,
    },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env_or("HOST", "0.0.0.0"),
            port: env_parse("PORT", 8080)?,
            file_destination: env_or("FILE_DESTINATION", "/data").into(),
            irc_server: env_or("IRC_SERVER", ""),
            irc_nick: env_or("IRC_NICK", ""),
            irc_channel: env_or("IRC_CHANNEL", ""),
            irc_nickserv_password: std::env::var("IRC_NICKSERV_PASSWORD").ok().filter(|s| !s.is_empty()),
            progress_interval: Duration::from_secs(env_parse("PROGRESS_INTERVAL", 1)?),
            progress_update_percent: env_parse("PROGRESS_UPDATE_PERCENT", 5)?,
            log_file: std::env::var("LOG_FILE").ok().map(Into::into),
            debug: env_bool("DEBUG", false)?,
            disable_progress_ansi: env_bool("DISABLE_PROGRESS_ANSI", true)?,
            reject_private_ip: env_bool("DCC_REJECT_PRIVATE_IP", true)?,
        })
    }
}

fn env_or(name: &'static str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match std::env::var(name) {
        Ok(v) => v.parse().map_err(|_| ConfigError::Invalid {
            name,
            value: v,
            kind: std::any::type_name::<T>(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(ConfigError::Invalid {
                name,
                value: other.to_string(),
                kind: "boolean",
            }),
        },
        Err(_) => Ok(default),
    }
}
