use serde::Deserialize;

pub const ENV_PREFIX: &str = "SMTP_TO_GOTIFY_";

pub const DEFAULT_ADDR: &str = ":2525";
pub const DEFAULT_DOMAIN: &str = "localhost";
pub const DEFAULT_USERNAME: &str = "admin";
pub const DEFAULT_PASSWORD: &str = "password";
pub const DEFAULT_GOTIFY_HOST: &str = "https://gotify.example.com";

/// An error while resolving the configuration.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid boolean for {key}: {value:?}")]
    InvalidBool { key: String, value: String },
}

/// The configuration for the server.
///
/// The server never changes it; to apply a new configuration
/// the server must be started again with a fresh value.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize)]
pub struct Config {
    /// The address to listen on.
    ///
    /// An address without a host, like `:2525`,
    /// listens on all interfaces.
    pub listen_addr: String,
    /// The domain announced in the greeting and `EHLO` reply.
    pub domain: String,
    pub username: String,
    pub password: String,
    /// Reject `MAIL`, `RCPT` and `DATA` until the client authenticated.
    pub auth_required: bool,
    /// Base url of the Gotify server.
    pub notification_host: String,
    /// Gotify application token.
    pub notification_token: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_ADDR.to_string(),
            domain: DEFAULT_DOMAIN.to_string(),
            username: DEFAULT_USERNAME.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            auth_required: true,
            notification_host: DEFAULT_GOTIFY_HOST.to_string(),
            notification_token: String::new(),
        }
    }
}

impl Config {
    /// Resolve the configuration from `SMTP_TO_GOTIFY_*` environment variables,
    /// using the defaults for anything not set.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve the configuration through `lookup`,
    /// which is called with the full variable name.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, Error> {
        let get = |key: &str| lookup(&format!("{ENV_PREFIX}{key}"));
        let mut config = Config::default();
        if let Some(value) = get("SMTP_ADDR") {
            config.listen_addr = value;
        }
        if let Some(value) = get("SMTP_DOMAIN") {
            config.domain = value;
        }
        if let Some(value) = get("SMTP_SMTP_USERNAME") {
            config.username = value;
        }
        if let Some(value) = get("SMTP_SMTP_PASSWORD") {
            config.password = value;
        }
        if let Some(value) = get("SMTP_AUTH_REQUIRED") {
            config.auth_required = parse_bool(&value).ok_or_else(|| {
                Error::InvalidBool {
                    key: format!("{ENV_PREFIX}SMTP_AUTH_REQUIRED"),
                    value,
                }
            })?;
        }
        if let Some(value) = get("GOTIFY_GOTIFY_HOST") {
            config.notification_host = value;
        }
        if let Some(value) = get("GOTIFY_GOTIFY_TOKEN") {
            config.notification_token = value;
        }
        Ok(config)
    }

    /// The address to bind to.
    pub fn bind_address(&self) -> String {
        match self.listen_addr.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => self.listen_addr.clone(),
        }
    }

    /// The url notifications are posted to.
    pub fn notification_url(&self) -> String {
        format!(
            "{}/message?token={}",
            self.notification_host.trim_end_matches('/'),
            self.notification_token
        )
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Some(true),
        "0" | "f" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
