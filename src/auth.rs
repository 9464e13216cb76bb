use crate::config::Config;

/// Who a test session speaks for. A missing token means the merchant is not
/// logged in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub token: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, token: Option<String>) -> Self {
        Self {
            username: username.into(),
            token: normalize_token(token),
        }
    }

    /// Configured defaults, overridden by non-blank per-session values.
    pub fn resolve(config: &Config, username: Option<String>, token: Option<String>) -> Self {
        let username = username
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| config.username.clone());
        let token = normalize_token(token).or_else(|| config.token.clone());
        Self::new(username, token)
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

fn normalize_token(token: Option<String>) -> Option<String> {
    token
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}
