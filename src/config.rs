//! Connection configuration.
//!
//! One flat struct per connection. Every field has a default, so a TOML file
//! only needs the settings that differ:
//!
//! ```toml
//! domain = "example.com"
//! security = "required"
//! reply_timeout = 10000
//!
//! [credentials]
//! type = "password"
//! username = "juliet"
//! password = "r0m30"
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::jid::Jid;
use crate::transport::dns::ServerSetting;

/// Durations are written as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Transport encryption policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// Refuse to authenticate without TLS.
    Required,
    /// Use TLS whenever the server offers it.
    #[default]
    Enabled,
    /// Never negotiate TLS.
    Disabled,
}

/// Where authentication credentials come from.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialSource {
    Password {
        username: String,
        password: String,
    },
    /// Read from environment variables when connecting.
    Environment {
        username_var: String,
        password_var: String,
    },
    #[default]
    Anonymous,
}

impl fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            CredentialSource::Environment {
                username_var,
                password_var,
            } => f
                .debug_struct("Environment")
                .field("username_var", username_var)
                .field("password_var", password_var)
                .finish(),
            CredentialSource::Anonymous => write!(f, "Anonymous"),
        }
    }
}

/// Resolved username and password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl CredentialSource {
    /// `None` for anonymous login.
    pub fn resolve(&self) -> Result<Option<Credentials>> {
        match self {
            CredentialSource::Password { username, password } => Ok(Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            })),
            CredentialSource::Environment {
                username_var,
                password_var,
            } => {
                let read = |var: &str| {
                    std::env::var(var)
                        .map_err(|e| Error::Config(format!("Cannot read ${}: {}", var, e)))
                };
                Ok(Some(Credentials {
                    username: read(username_var)?,
                    password: read(password_var)?,
                }))
            }
            CredentialSource::Anonymous => Ok(None),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, CredentialSource::Anonymous)
    }
}

/// What a sender experiences when the outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Wait for room.
    #[default]
    Block,
    /// Fail with `Error::QueueFull`.
    FailFast,
}

/// What happens to an inbound unit that cannot be turned into a stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParsingPolicy {
    /// Fail the connection.
    #[default]
    Escalate,
    /// Log it and carry on.
    DropAndLog,
}

/// Handling of inbound get/set IQs nobody listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownIqReplyMode {
    /// Answer with `service-unavailable`.
    #[default]
    Reply,
    DoNotReply,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// XMPP domain of the account.
    pub domain: String,
    /// Explicit endpoint (`tls://host:port`, `tcp://host:port[?domain=d]`,
    /// `host:port`); SRV resolution of `domain` when absent.
    pub server: Option<String>,
    pub security: SecurityMode,
    pub credentials: CredentialSource,
    /// Requested resource; the server picks one when absent.
    pub resource: Option<String>,
    #[serde(with = "duration_ms")]
    pub reply_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Upper bound on a single listener invocation.
    #[serde(with = "duration_ms")]
    pub listener_timeout: Duration,
    pub outbound_queue_capacity: usize,
    pub backpressure: BackpressurePolicy,
    pub parsing_policy: ParsingPolicy,
    /// Catalogue modules not to use, by name.
    pub disabled_modules: Vec<String>,
    /// Send an initial available presence once connected.
    pub send_presence: bool,
    pub allow_plain_without_tls: bool,
    /// Enable and resume XEP-0198 stream management when offered.
    pub stream_management: bool,
    pub unknown_iq_reply: UnknownIqReplyMode,
    /// Largest inbound unit accepted, in bytes.
    pub max_stanza_size: usize,
    /// Skip certificate verification. Testing only.
    pub dangerous_insecure_tls: bool,
    pub lang: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain: String::new(),
            server: None,
            security: SecurityMode::default(),
            credentials: CredentialSource::default(),
            resource: None,
            reply_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(15),
            listener_timeout: Duration::from_secs(5),
            outbound_queue_capacity: 256,
            backpressure: BackpressurePolicy::default(),
            parsing_policy: ParsingPolicy::default(),
            disabled_modules: Vec::new(),
            send_presence: true,
            allow_plain_without_tls: false,
            stream_management: true,
            unknown_iq_reply: UnknownIqReplyMode::default(),
            max_stanza_size: 1_024 * 1_024,
            dangerous_insecure_tls: false,
            lang: "en".to_string(),
        }
    }
}

impl Config {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Default::default()
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        let domain: Jid = self
            .domain
            .parse()
            .map_err(|_| Error::Config(format!("Invalid domain '{}'", self.domain)))?;
        if domain.local().is_some() || domain.resource().is_some() {
            return Err(Error::Config(format!(
                "Domain '{}' must not contain a local part or resource",
                self.domain
            )));
        }
        if let Some(server) = &self.server {
            if let ServerSetting::Endpoint(endpoint) = ServerSetting::parse(server) {
                if endpoint.host.is_empty() {
                    return Err(Error::Config(format!("Server '{}' has no host", server)));
                }
            } else if server.trim().is_empty() {
                return Err(Error::Config("Server must not be empty".to_string()));
            }
        }
        if self.resource.as_deref().is_some_and(|r| r.trim().is_empty()) {
            return Err(Error::Config("Resource must not be empty".to_string()));
        }
        for (name, value) in [
            ("reply_timeout", self.reply_timeout),
            ("connect_timeout", self.connect_timeout),
            ("listener_timeout", self.listener_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }
        if self.outbound_queue_capacity == 0 {
            return Err(Error::Config(
                "outbound_queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.max_stanza_size < 4096 {
            return Err(Error::Config("max_stanza_size must be at least 4096".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new("example.com");
        assert_eq!(config.security, SecurityMode::Enabled);
        assert_eq!(config.reply_timeout, Duration::from_secs(5));
        assert_eq!(config.backpressure, BackpressurePolicy::Block);
        assert_eq!(config.parsing_policy, ParsingPolicy::Escalate);
        assert_eq!(config.unknown_iq_reply, UnknownIqReplyMode::Reply);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = Config::from_toml_str(
            r#"
            domain = "example.com"
            server = "tls://xmpp.example.com:5223"
            security = "required"
            reply_timeout = 10000
            backpressure = "fail_fast"
            parsing_policy = "drop_and_log"
            disabled_modules = ["sasl-plain"]

            [credentials]
            type = "password"
            username = "juliet"
            password = "r0m30"
            "#,
        )
        .unwrap();
        assert_eq!(config.security, SecurityMode::Required);
        assert_eq!(config.reply_timeout, Duration::from_secs(10));
        assert_eq!(config.backpressure, BackpressurePolicy::FailFast);
        assert_eq!(config.parsing_policy, ParsingPolicy::DropAndLog);
        assert_eq!(config.disabled_modules, vec!["sasl-plain".to_string()]);
        let credentials = config.credentials.resolve().unwrap().unwrap();
        assert_eq!(credentials.username, "juliet");
        // Untouched fields keep their defaults
        assert_eq!(config.outbound_queue_capacity, 256);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(Config::default().validate().is_err());
        assert!(Config::new("user@example.com").validate().is_err());

        let mut config = Config::new("example.com");
        config.reply_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::new("example.com");
        config.outbound_queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::new("example.com");
        config.server = Some("tls://:5223".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        assert!(matches!(
            Config::from_toml_str("domain = 42"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let source = CredentialSource::Password {
            username: "juliet".to_string(),
            password: "r0m30".to_string(),
        };
        let debug = format!("{:?}", source);
        assert!(debug.contains("juliet"));
        assert!(!debug.contains("r0m30"));
    }

    #[test]
    fn test_environment_credentials() {
        std::env::set_var("FLUUX_XMPP_TEST_USER", "romeo");
        std::env::set_var("FLUUX_XMPP_TEST_PASS", "secret");
        let source = CredentialSource::Environment {
            username_var: "FLUUX_XMPP_TEST_USER".to_string(),
            password_var: "FLUUX_XMPP_TEST_PASS".to_string(),
        };
        let credentials = source.resolve().unwrap().unwrap();
        assert_eq!(credentials.username, "romeo");
        assert_eq!(credentials.password, "secret");

        let missing = CredentialSource::Environment {
            username_var: "FLUUX_XMPP_TEST_MISSING".to_string(),
            password_var: "FLUUX_XMPP_TEST_PASS".to_string(),
        };
        assert!(matches!(missing.resolve(), Err(Error::Config(_))));
    }
}
