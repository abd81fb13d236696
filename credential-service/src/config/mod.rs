use chrono::Duration;
use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

use crate::services::lockout::LockoutSettings;
use crate::services::mfa::MfaSettings;
use crate::services::oauth::OAuthSettings;
use crate::services::remember_me::RememberMeSettings;
use crate::services::session::SessionSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub store_backend: StoreBackend,
    pub database: DatabaseConfig,
    pub lockout: LockoutConfig,
    pub session: SessionConfig,
    pub mfa: MfaConfig,
    pub remember_me: RememberMeConfig,
    pub oauth: OAuthConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockoutConfig {
    pub threshold: i32,
    pub duration_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub idle_timeout_minutes: i64,
    pub absolute_timeout_hours: i64,
    pub cookie_name: String,
    pub cookie_secure: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MfaConfig {
    pub code_ttl_minutes: i64,
    pub code_max_attempts: i32,
    pub recovery_code_count: usize,
    pub trusted_device_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RememberMeConfig {
    pub ttl_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    pub code_ttl_seconds: i64,
    pub allow_plain_pkce: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
}

impl AuthConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let store_backend: StoreBackend = get_env("STORE_BACKEND", Some("postgres"), is_prod)?
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        // A memory store has no database to point at.
        let database_url = if store_backend == StoreBackend::Memory {
            env::var("DATABASE_URL").unwrap_or_default()
        } else {
            get_env(
                "DATABASE_URL",
                Some("postgres://localhost/credentials"),
                is_prod,
            )?
        };

        let config = AuthConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("credential-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            store_backend,
            database: DatabaseConfig {
                url: database_url,
                max_connections: get_env_parsed("DATABASE_MAX_CONNECTIONS", "10", is_prod)?,
                min_connections: get_env_parsed("DATABASE_MIN_CONNECTIONS", "1", is_prod)?,
            },
            lockout: LockoutConfig {
                threshold: get_env_parsed("LOCKOUT_THRESHOLD", "5", is_prod)?,
                duration_minutes: get_env_parsed("LOCKOUT_DURATION_MINUTES", "15", is_prod)?,
            },
            session: SessionConfig {
                idle_timeout_minutes: get_env_parsed("SESSION_IDLE_TIMEOUT_MINUTES", "30", is_prod)?,
                absolute_timeout_hours: get_env_parsed(
                    "SESSION_ABSOLUTE_TIMEOUT_HOURS",
                    "12",
                    is_prod,
                )?,
                cookie_name: get_env("SESSION_COOKIE_NAME", Some("sid"), is_prod)?,
                cookie_secure: get_env("SESSION_COOKIE_SECURE", Some("false"), is_prod)?
                    .parse()
                    .unwrap_or(true),
            },
            mfa: MfaConfig {
                code_ttl_minutes: get_env_parsed("MFA_CODE_TTL_MINUTES", "10", is_prod)?,
                code_max_attempts: get_env_parsed("MFA_CODE_MAX_ATTEMPTS", "5", is_prod)?,
                recovery_code_count: get_env_parsed("MFA_RECOVERY_CODE_COUNT", "10", is_prod)?,
                trusted_device_days: get_env_parsed("TRUSTED_DEVICE_DAYS", "30", is_prod)?,
            },
            remember_me: RememberMeConfig {
                ttl_days: get_env_parsed("REMEMBER_ME_DAYS", "30", is_prod)?,
            },
            oauth: OAuthConfig {
                code_ttl_seconds: get_env_parsed("OAUTH_CODE_TTL_SECONDS", "600", is_prod)?,
                allow_plain_pkce: get_env("OAUTH_ALLOW_PLAIN_PKCE", Some("false"), is_prod)?
                    .parse()
                    .unwrap_or(false),
            },
            security: SecurityConfig {
                allowed_origins: get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.lockout.threshold <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "LOCKOUT_THRESHOLD must be positive"
            )));
        }

        let durations = [
            ("LOCKOUT_DURATION_MINUTES", self.lockout.duration_minutes),
            ("SESSION_IDLE_TIMEOUT_MINUTES", self.session.idle_timeout_minutes),
            ("SESSION_ABSOLUTE_TIMEOUT_HOURS", self.session.absolute_timeout_hours),
            ("MFA_CODE_TTL_MINUTES", self.mfa.code_ttl_minutes),
            ("TRUSTED_DEVICE_DAYS", self.mfa.trusted_device_days),
            ("REMEMBER_ME_DAYS", self.remember_me.ttl_days),
            ("OAUTH_CODE_TTL_SECONDS", self.oauth.code_ttl_seconds),
        ];
        if let Some((key, _)) = durations.iter().find(|(_, value)| *value <= 0) {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "{} must be positive",
                key
            )));
        }

        if self.mfa.code_max_attempts <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "MFA_CODE_MAX_ATTEMPTS must be positive"
            )));
        }

        if self.session.idle_timeout_minutes > self.session.absolute_timeout_hours * 60 {
            tracing::warn!(
                "SESSION_IDLE_TIMEOUT_MINUTES exceeds the absolute timeout; the absolute timeout wins"
            );
        }

        // In production, ensure stricter validation
        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if self.store_backend == StoreBackend::Memory {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "STORE_BACKEND=memory is not allowed in production"
                )));
            }

            if self.oauth.allow_plain_pkce {
                tracing::warn!("Plain PKCE is enabled in production");
            }
        }

        Ok(())
    }

    /// Development defaults on the in-memory store, without reading the
    /// environment.
    pub fn local_defaults() -> Self {
        AuthConfig {
            common: core_config::Config { port: 8080 },
            environment: Environment::Dev,
            service_name: "credential-service".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
            otlp_endpoint: None,
            store_backend: StoreBackend::Memory,
            database: DatabaseConfig {
                url: String::new(),
                max_connections: 10,
                min_connections: 1,
            },
            lockout: LockoutConfig {
                threshold: 5,
                duration_minutes: 15,
            },
            session: SessionConfig {
                idle_timeout_minutes: 30,
                absolute_timeout_hours: 12,
                cookie_name: "sid".to_string(),
                cookie_secure: false,
            },
            mfa: MfaConfig {
                code_ttl_minutes: 10,
                code_max_attempts: 5,
                recovery_code_count: 10,
                trusted_device_days: 30,
            },
            remember_me: RememberMeConfig { ttl_days: 30 },
            oauth: OAuthConfig {
                code_ttl_seconds: 600,
                allow_plain_pkce: false,
            },
            security: SecurityConfig {
                allowed_origins: vec!["http://localhost:3000".to_string()],
            },
        }
    }

    pub fn lockout_settings(&self) -> LockoutSettings {
        LockoutSettings {
            threshold: self.lockout.threshold,
            duration: Duration::minutes(self.lockout.duration_minutes),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            idle_timeout: Duration::minutes(self.session.idle_timeout_minutes),
            absolute_timeout: Duration::hours(self.session.absolute_timeout_hours),
        }
    }

    pub fn mfa_settings(&self) -> MfaSettings {
        MfaSettings {
            code_ttl: Duration::minutes(self.mfa.code_ttl_minutes),
            max_attempts: self.mfa.code_max_attempts,
            recovery_code_count: self.mfa.recovery_code_count,
            trusted_device_ttl: Duration::days(self.mfa.trusted_device_days),
        }
    }

    pub fn oauth_settings(&self) -> OAuthSettings {
        OAuthSettings {
            code_ttl: Duration::seconds(self.oauth.code_ttl_seconds),
            allow_plain_pkce: self.oauth.allow_plain_pkce,
        }
    }

    pub fn remember_me_settings(&self) -> RememberMeSettings {
        RememberMeSettings {
            ttl: Duration::days(self.remember_me.ttl_days),
        }
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn get_env_parsed<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .trim()
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            _ => Err(format!("Invalid store backend: {}", s)),
        }
    }
}
