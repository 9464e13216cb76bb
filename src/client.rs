use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use tracing::debug;

use crate::config::Config;
use crate::error::ApiError;
use crate::types::{TestChatRequest, TestChatResponse};

/// The remote endpoints a test session depends on.
#[async_trait]
pub trait BotmonApi: Send + Sync {
    /// Returns the `data` object of the history envelope.
    async fn fetch_chat_history(&self, token: &str) -> Result<Value, ApiError>;

    async fn send_test_message(
        &self,
        token: &str,
        body: &TestChatRequest,
    ) -> Result<TestChatResponse, ApiError>;
}

pub struct HttpBotmonApi {
    client: reqwest::Client,
    history_url: Url,
    test_chat_url: Url,
}

impl HttpBotmonApi {
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            history_url: endpoint(&config.api_url, &config.history_path),
            test_chat_url: endpoint(&config.api_url, &config.test_chat_path),
        })
    }
}

fn endpoint(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    let joined = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    url
}

async fn read_json(response: reqwest::Response) -> Result<Value, ApiError> {
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::Status { status, body });
    }
    let text = response.text().await?;
    Ok(serde_json::from_str(&text)?)
}

#[async_trait]
impl BotmonApi for HttpBotmonApi {
    async fn fetch_chat_history(&self, token: &str) -> Result<Value, ApiError> {
        debug!("fetching chat history from {}", self.history_url);
        let response = self
            .client
            .get(self.history_url.clone())
            .bearer_auth(token)
            .send()
            .await?;
        let mut payload = read_json(response).await?;
        Ok(payload
            .get_mut("data")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    async fn send_test_message(
        &self,
        token: &str,
        body: &TestChatRequest,
    ) -> Result<TestChatResponse, ApiError> {
        debug!("sending test message to {}", self.test_chat_url);
        let response = self
            .client
            .post(self.test_chat_url.clone())
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        let payload = read_json(response).await?;
        Ok(serde_json::from_value(payload)?)
    }
}
