use chrono::Duration;
use secrecy::{ExposeSecret, SecretString};
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub token: TokenPolicy,
    pub sessions: SessionPolicy,
    pub approvals: ApprovalPolicy,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
    pub provisioning: ProvisioningConfig,
    pub bootstrap: Option<BootstrapConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// `postgres://...`, or `memory://` for the in-process store.
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.url.starts_with("memory://")
    }
}

/// Token signing and lifetime policy.
#[derive(Debug, Clone)]
pub struct TokenPolicy {
    pub secret: SecretString,
    pub issuer: String,
    pub audience: String,
    pub ttl: Duration,
    /// Lifetime of "remember me" tokens.
    pub extended_ttl: Duration,
    /// Lifetime of the challenge handed out while a second factor is pending.
    pub challenge_ttl: Duration,
}

impl TokenPolicy {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: SecretString::new(secret.into()),
            issuer: "identity-service".to_string(),
            audience: "identity-clients".to_string(),
            ttl: Duration::days(7),
            extended_ttl: Duration::days(30),
            challenge_ttl: Duration::minutes(5),
        }
    }
}

/// Session concurrency and idle policy.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub max_sessions_per_user: usize,
    pub inactivity_timeout: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            max_sessions_per_user: 2,
            inactivity_timeout: Duration::minutes(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApprovalPolicy {
    pub ttl: Duration,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::hours(24),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub login_attempts: u32,
    pub login_window_seconds: u64,
    pub global_ip_limit: u32,
    pub global_ip_window_seconds: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ProvisioningConfig {
    /// Unset disables provisioning side effects.
    pub base_url: Option<String>,
    pub api_key: Option<SecretString>,
    pub timeout_seconds: u64,
}

/// Initial superuser created at startup when absent.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub email: String,
    pub password: SecretString,
    pub display_name: String,
}

impl IdentityConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let bootstrap = match (
            env::var("BOOTSTRAP_ADMIN_EMAIL").ok(),
            env::var("BOOTSTRAP_ADMIN_PASSWORD").ok(),
        ) {
            (Some(email), Some(password)) => Some(BootstrapConfig {
                email,
                password: SecretString::new(password),
                display_name: get_env("BOOTSTRAP_ADMIN_NAME", Some("Administrator"), false)?,
            }),
            _ => None,
        };

        let config = IdentityConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("identity-service"), false)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), false)?,
            log_level: get_env("LOG_LEVEL", Some("info"), false)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", Some("memory://"), is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 1)?,
            },
            token: TokenPolicy {
                secret: SecretString::new(get_env("TOKEN_SECRET", None, is_prod)?),
                issuer: get_env("TOKEN_ISSUER", Some("identity-service"), false)?,
                audience: get_env("TOKEN_AUDIENCE", Some("identity-clients"), false)?,
                ttl: Duration::days(parse_env("TOKEN_TTL_DAYS", 7)?),
                extended_ttl: Duration::days(parse_env("TOKEN_EXTENDED_TTL_DAYS", 30)?),
                challenge_ttl: Duration::minutes(parse_env("TOKEN_CHALLENGE_TTL_MINUTES", 5)?),
            },
            sessions: SessionPolicy {
                max_sessions_per_user: parse_env("SESSION_MAX_PER_USER", 2)?,
                inactivity_timeout: Duration::minutes(parse_env(
                    "SESSION_INACTIVITY_TIMEOUT_MINUTES",
                    10,
                )?),
            },
            approvals: ApprovalPolicy {
                ttl: Duration::hours(parse_env("APPROVAL_TTL_HOURS", 24)?),
            },
            security: SecurityConfig {
                allowed_origins: get_env("ALLOWED_ORIGINS", Some("http://localhost:3000"), is_prod)?
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            rate_limit: RateLimitConfig {
                login_attempts: parse_env("RATE_LIMIT_LOGIN_ATTEMPTS", 5)?,
                login_window_seconds: parse_env("RATE_LIMIT_LOGIN_WINDOW_SECONDS", 900)?,
                global_ip_limit: parse_env("RATE_LIMIT_GLOBAL_IP_LIMIT", 100)?,
                global_ip_window_seconds: parse_env("RATE_LIMIT_GLOBAL_IP_WINDOW_SECONDS", 60)?,
            },
            provisioning: ProvisioningConfig {
                base_url: env::var("PROVISIONING_URL").ok().filter(|s| !s.is_empty()),
                api_key: env::var("PROVISIONING_API_KEY").ok().map(SecretString::new),
                timeout_seconds: parse_env("PROVISIONING_TIMEOUT_SECONDS", 10)?,
            },
            bootstrap,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.token.secret.expose_secret().len() < 32 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TOKEN_SECRET must be at least 32 bytes"
            )));
        }

        if self.token.ttl <= Duration::zero()
            || self.token.extended_ttl <= Duration::zero()
            || self.token.challenge_ttl <= Duration::zero()
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Token lifetimes must be positive"
            )));
        }

        if self.sessions.max_sessions_per_user == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SESSION_MAX_PER_USER must be at least 1"
            )));
        }

        if self.sessions.inactivity_timeout <= Duration::zero() || self.approvals.ttl <= Duration::zero()
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Session inactivity timeout and approval TTL must be positive"
            )));
        }

        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if self.database.is_memory() {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "The in-memory store is not allowed in production"
                )));
            }
        }

        Ok(())
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

fn parse_env<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val.trim().parse().map_err(|e: T::Err| {
            AppError::ConfigError(anyhow::anyhow!("{} is invalid: {}", key, e))
        }),
        Err(_) => Ok(default),
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> IdentityConfig {
        IdentityConfig {
            common: core_config::Config::default(),
            environment: Environment::Dev,
            service_name: "identity-service".to_string(),
            service_version: "test".to_string(),
            log_level: "error".to_string(),
            otlp_endpoint: None,
            database: DatabaseConfig {
                url: "memory://".to_string(),
                max_connections: 1,
                min_connections: 1,
            },
            token: TokenPolicy::new("0123456789abcdef0123456789abcdef"),
            sessions: SessionPolicy::default(),
            approvals: ApprovalPolicy::default(),
            security: SecurityConfig {
                allowed_origins: vec!["http://localhost:3000".to_string()],
            },
            rate_limit: RateLimitConfig {
                login_attempts: 5,
                login_window_seconds: 900,
                global_ip_limit: 100,
                global_ip_window_seconds: 60,
            },
            provisioning: ProvisioningConfig::default(),
            bootstrap: None,
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_short_secret_rejected() {
        let mut c = config();
        c.token = TokenPolicy::new("too-short");
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_zero_session_limit_rejected() {
        let mut c = config();
        c.sessions.max_sessions_per_user = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_prod_rejects_memory_store_and_wildcard_origin() {
        let mut c = config();
        c.environment = Environment::Prod;
        assert!(c.validate().is_err());

        c.database.url = "postgres://localhost/identity".to_string();
        assert!(c.validate().is_ok());

        c.security.allowed_origins = vec!["*".to_string()];
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_policy_defaults() {
        assert_eq!(SessionPolicy::default().max_sessions_per_user, 2);
        assert_eq!(SessionPolicy::default().inactivity_timeout, Duration::minutes(10));
        assert_eq!(ApprovalPolicy::default().ttl, Duration::hours(24));
        let token = TokenPolicy::new("x");
        assert_eq!(token.ttl, Duration::days(7));
        assert_eq!(token.extended_ttl, Duration::days(30));
    }
}
