use std::{env, time::Duration};

use reqwest::Url;

use crate::error::ConfigError;

const DEFAULT_PORT: u16 = 4000;
const DEFAULT_API_URL: &str = "http://localhost:8000";
const DEFAULT_HISTORY_PATH: &str = "/api/chatbot/history";
const DEFAULT_TEST_CHAT_PATH: &str = "/api/chatbot/test-chat";
const DEFAULT_USERNAME: &str = "test_user";
const DEFAULT_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub api_url: Url,
    pub history_path: String,
    pub test_chat_path: String,
    pub username: String,
    pub token: Option<String>,
    pub request_timeout: Duration,
}

impl Config {
    /// Reads the environment, loading `.env` first when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let port = text("PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        let raw_url = text("BOTMON_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let api_url = parse_base_url(&raw_url)?;
        let request_timeout = text("BOTMON_REQUEST_TIMEOUT_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        Ok(Self {
            port,
            api_url,
            history_path: text("BOTMON_HISTORY_PATH")
                .unwrap_or_else(|| DEFAULT_HISTORY_PATH.to_string()),
            test_chat_path: text("BOTMON_TEST_CHAT_PATH")
                .unwrap_or_else(|| DEFAULT_TEST_CHAT_PATH.to_string()),
            username: text("BOTMON_USERNAME").unwrap_or_else(|| DEFAULT_USERNAME.to_string()),
            token: text("BOTMON_TOKEN"),
            request_timeout: Duration::from_secs(request_timeout),
        })
    }

    /// Config pointing at `api_url` with every other value defaulted.
    pub fn for_api(api_url: &str) -> Result<Self, ConfigError> {
        let api_url = api_url.to_string();
        Self::from_lookup(move |key| (key == "BOTMON_API_URL").then(|| api_url.clone()))
    }
}

fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|err| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: "expected an http(s) base url".to_string(),
        });
    }
    Ok(url)
}
