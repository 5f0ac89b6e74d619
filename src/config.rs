//! Environment-driven configuration.
//!
//! Loaded with the `CHANBUS` prefix and `__` as the section separator:
//! `CHANBUS__SERVER__PORT=4000`, `CHANBUS__FABRIC__URL=redis://...`,
//! `CHANBUS__AUTH__SECRET=...`. A `.env` file is honored in development.

use serde::Deserialize;
use std::net::SocketAddr;

use crate::auth::JwtConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationError),
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("server port must be non-zero")]
    InvalidPort,
    #[error("websocket and http ports must differ")]
    PortClash,
    #[error("auth is enabled but no secret is configured")]
    MissingAuthSecret,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// WebSocket listener port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// REST/health listener port.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Tracing filter directive.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl ServerConfig {
    pub fn ws_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .expect("invalid websocket listen address")
    }

    pub fn http_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.http_port)
            .parse()
            .expect("invalid http listen address")
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 || self.http_port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        if self.port == self.http_port {
            return Err(ValidationError::PortClash);
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            http_port: default_http_port(),
            log_level: default_log_level(),
            max_connections: default_max_connections(),
        }
    }
}

/// Cross-instance fabric backend selection.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FabricMode {
    #[default]
    Pubsub,
    Stream,
}

/// External fabric configuration. Absent `url` disables cross-instance relay.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FabricConfig {
    pub url: Option<String>,
    #[serde(default)]
    pub mode: FabricMode,
    /// Optional auth token appended to the connection URL.
    pub token: Option<String>,
}

impl FabricConfig {
    pub fn enabled(&self) -> bool {
        self.url.is_some()
    }

    /// Connection URL with the token substituted in, when configured.
    pub fn connection_url(&self) -> Option<String> {
        let url = self.url.clone()?;
        match &self.token {
            Some(token) if !url.contains('@') => {
                Some(url.replacen("redis://", &format!("redis://:{token}@"), 1))
            }
            _ => Some(url),
        }
    }
}

/// Join authentication. Disabled by default; when enabled a secret is
/// mandatory.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    pub secret: Option<String>,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

impl AuthConfig {
    pub fn jwt(&self) -> Option<JwtConfig> {
        if !self.enabled {
            return None;
        }
        self.secret.as_ref().map(|s| JwtConfig {
            secret: s.clone().into_bytes(),
            issuer: self.issuer.clone(),
            audience: self.audience.clone(),
        })
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.enabled && self.secret.as_deref().unwrap_or("").is_empty() {
            return Err(ValidationError::MissingAuthSecret);
        }
        Ok(())
    }
}

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub fabric: FabricConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl AppConfig {
    /// Load from environment variables (and `.env` when present).
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let cfg = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .prefix("CHANBUS")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        let app: AppConfig = cfg.try_deserialize()?;
        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.server.validate()?;
        self.auth.validate()?;
        Ok(())
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4000
}

fn default_http_port() -> u16 {
    4001
}

fn default_log_level() -> String {
    "info,chanbus=debug".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.port, 4000);
        assert_eq!(cfg.server.http_port, 4001);
        assert!(!cfg.fabric.enabled());
        assert!(cfg.auth.jwt().is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_auth_requires_secret() {
        let cfg = AppConfig {
            auth: AuthConfig {
                enabled: true,
                secret: None,
                issuer: None,
                audience: None,
            },
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ValidationError::MissingAuthSecret)
        ));
    }

    #[test]
    fn test_port_clash_rejected() {
        let cfg = AppConfig {
            server: ServerConfig {
                port: 4000,
                http_port: 4000,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ValidationError::PortClash)));
    }

    #[test]
    fn test_fabric_token_substitution() {
        let cfg = FabricConfig {
            url: Some("redis://fabric.internal:6379".into()),
            mode: FabricMode::Pubsub,
            token: Some("s3cret".into()),
        };
        assert_eq!(
            cfg.connection_url().unwrap(),
            "redis://:s3cret@fabric.internal:6379"
        );
    }
}
