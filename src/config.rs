use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub analytics: AnalyticsConfig,
    pub webhook: WebhookConfig,
    pub business: BusinessConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    /// Filesystem path behind a `sqlite://` URL; a bare path is taken as-is.
    pub fn sqlite_path(&self) -> &str {
        self.url.strip_prefix("sqlite://").unwrap_or(&self.url)
    }
}

/// Connection settings for the analytics service that serves the
/// opportunity report (a Metabase-style question card API).
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyticsConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Id of the saved question that returns open field-service opportunities.
    pub report_id: u32,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Webhook of the internal operations channel that receives escalations.
    pub internal_ops_url: Option<String>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusinessConfig {
    /// Fixed UTC offset of the business timezone, in hours. The deployment
    /// region (UTC+8) has no DST, but the offset stays configurable.
    pub timezone_offset_hours: i32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/fsoa.db".to_string()),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            analytics: AnalyticsConfig {
                base_url: env::var("ANALYTICS_BASE_URL")
                    .map_err(|_| ConfigError::MissingEnv("ANALYTICS_BASE_URL".to_string()))?,
                username: env::var("ANALYTICS_USERNAME")
                    .map_err(|_| ConfigError::MissingEnv("ANALYTICS_USERNAME".to_string()))?,
                password: env::var("ANALYTICS_PASSWORD")
                    .map_err(|_| ConfigError::MissingEnv("ANALYTICS_PASSWORD".to_string()))?,
                report_id: env::var("ANALYTICS_REPORT_ID")
                    .unwrap_or_else(|_| "1".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("ANALYTICS_REPORT_ID".to_string()))?,
                timeout_seconds: env::var("ANALYTICS_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
            },
            webhook: WebhookConfig {
                internal_ops_url: env::var("INTERNAL_OPS_WEBHOOK_URL").ok(),
                timeout_seconds: env::var("WEBHOOK_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
            },
            business: BusinessConfig {
                timezone_offset_hours: env::var("BUSINESS_TIMEZONE_OFFSET_HOURS")
                    .unwrap_or_else(|_| "8".to_string())
                    .parse()
                    .unwrap_or(8),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: "sqlite://data/fsoa.db".to_string(),
                max_connections: 5,
            },
            analytics: AnalyticsConfig {
                base_url: "http://localhost:3000".to_string(),
                username: String::new(),
                password: String::new(),
                report_id: 1,
                timeout_seconds: 30,
            },
            webhook: WebhookConfig {
                internal_ops_url: None,
                timeout_seconds: 10,
            },
            business: BusinessConfig {
                timezone_offset_hours: 8,
            },
        }
    }
}
