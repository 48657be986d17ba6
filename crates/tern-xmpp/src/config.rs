use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use xmpp_parsers::jid::BareJid;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path}")]
    FileNotFound { path: String },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    pub jid: String,
    pub password: String,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u32,
    /// Zero means unlimited.
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    /// Zero disables the idle check on the inbound path.
    #[serde(default)]
    pub idle_timeout_seconds: u32,
    #[serde(default)]
    pub modules: ModulesConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsPolicy {
    #[default]
    Required,
    IfPossible,
    Disabled,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModulesConfig {
    #[serde(default)]
    pub tls: TlsPolicy,
    #[serde(default)]
    pub compression: bool,
    #[serde(default = "default_compression_methods")]
    pub compression_methods: Vec<String>,
    #[serde(default)]
    pub fail_on_unreachable_states: bool,
    #[serde(default)]
    pub stream_management: StreamManagementConfig,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            tls: TlsPolicy::default(),
            compression: false,
            compression_methods: default_compression_methods(),
            fail_on_unreachable_states: false,
            stream_management: StreamManagementConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamManagementConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub resumption: bool,
    #[serde(default)]
    pub preferred_resumption_seconds: Option<u32>,
    #[serde(default = "default_ack_request_interval")]
    pub ack_request_interval: u32,
    #[serde(default = "default_true")]
    pub ack_on_iq_requests: bool,
    #[serde(default = "default_unacked_queue_capacity")]
    pub unacked_queue_capacity: usize,
}

impl Default for StreamManagementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            resumption: true,
            preferred_resumption_seconds: None,
            ack_request_interval: default_ack_request_interval(),
            ack_on_iq_requests: true,
            unacked_queue_capacity: default_unacked_queue_capacity(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout_seconds() -> u32 {
    30
}

fn default_ack_request_interval() -> u32 {
    5
}

fn default_unacked_queue_capacity() -> usize {
    500
}

fn default_compression_methods() -> Vec<String> {
    vec!["zlib".to_string()]
}

impl ConnectionConfig {
    pub fn new(jid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            password: password.into(),
            server: None,
            port: None,
            resource: None,
            timeout_seconds: default_timeout_seconds(),
            max_reconnect_attempts: 0,
            idle_timeout_seconds: 0,
            modules: ModulesConfig::default(),
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_tls(mut self, tls: TlsPolicy) -> Self {
        self.modules.tls = tls;
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.modules.compression = enabled;
        self
    }

    pub fn with_stream_management(mut self, enabled: bool) -> Self {
        self.modules.stream_management.enabled = enabled;
        self
    }

    pub fn with_resumption(mut self, enabled: bool) -> Self {
        self.modules.stream_management.resumption = enabled;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_fail_on_unreachable_states(mut self, enabled: bool) -> Self {
        self.modules.fail_on_unreachable_states = enabled;
        self
    }

    /// Parse and validate a configuration from a TOML document.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: ConnectionConfig = toml::from_str(toml_str).map_err(|e| {
            let (line, column) = e.span().map_or((0, 0), |span| {
                let before = &toml_str[..span.start];
                let line = before.chars().filter(|&c| c == '\n').count() + 1;
                let column = before
                    .rfind('\n')
                    .map_or(span.start + 1, |nl| span.start - nl);
                (line, column)
            });
            ConfigError::InvalidToml {
                line,
                column,
                message: e.message().to_string(),
            }
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                });
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.jid.is_empty() {
            missing.push("jid".to_string());
        }
        if self.password.is_empty() {
            missing.push("password".to_string());
        }
        if !missing.is_empty() {
            return Err(ConfigError::MissingRequiredFields { fields: missing });
        }

        self.bare_jid()?;

        let sm = &self.modules.stream_management;
        if sm.ack_request_interval == 0 {
            return Err(ConfigError::InvalidValue {
                field: "modules.stream_management.ack_request_interval".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if sm.unacked_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "modules.stream_management.unacked_queue_capacity".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.modules.compression && self.modules.compression_methods.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "modules.compression_methods".to_string(),
                message: "compression is enabled but no method is configured".to_string(),
            });
        }

        Ok(())
    }

    pub fn bare_jid(&self) -> Result<BareJid, ConfigError> {
        BareJid::from_str(&self.jid).map_err(|e| ConfigError::InvalidValue {
            field: "jid".to_string(),
            message: e.to_string(),
        })
    }

    /// Domain part of the account JID, used as the stream `to` address.
    pub fn domain(&self) -> Result<String, ConfigError> {
        Ok(self.bare_jid()?.domain().to_string())
    }

    pub fn username(&self) -> Result<String, ConfigError> {
        let jid = self.bare_jid()?;
        jid.node()
            .map(|node| node.to_string())
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "jid".to_string(),
                message: "account JID has no local part".to_string(),
            })
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_seconds.max(1)))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_seconds > 0)
            .then(|| Duration::from_secs(u64::from(self.idle_timeout_seconds)))
    }
}
