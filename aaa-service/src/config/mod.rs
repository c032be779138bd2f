use secrecy::Secret;
use service_core::config::{self as core_config, get_env};
use service_core::error::AppError;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub cache: CacheConfig,
    pub audit: AuditConfig,
    /// Path to the service-authorization policy document (YAML).
    pub policy_file: Option<PathBuf>,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: Secret<String>,
    pub issuer: String,
    pub audience: Option<String>,
    pub access_token_expiry_minutes: i64,
    pub refresh_token_expiry_days: i64,
    /// The only clock-skew allowance, applied to both `nbf` and `exp`.
    pub leeway_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub perm_ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Buffered events before enqueue starts blocking callers.
    pub high_watermark: usize,
    pub retention_days: i64,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub global_ip_limit: u32,
    pub global_ip_window_seconds: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let environment = match get_env("ENVIRONMENT", Some("dev"), false)?.to_lowercase().as_str()
        {
            "prod" => Environment::Prod,
            _ => Environment::Dev,
        };
        let is_prod = environment == Environment::Prod;

        let config = AppConfig {
            common,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("aaa-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            database: DatabaseConfig {
                url: get_env(
                    "DATABASE_URL",
                    Some("postgres://localhost/aaa_service"),
                    is_prod,
                )?,
                max_connections: parse(get_env("DATABASE_MAX_CONNECTIONS", Some("10"), is_prod)?)?,
            },
            redis: RedisConfig {
                url: get_env("REDIS_URL", Some("redis://127.0.0.1/"), is_prod)?,
            },
            jwt: JwtConfig {
                secret: Secret::new(get_env(
                    "JWT_SECRET",
                    Some("dev-only-secret-change-me-in-prod!!"),
                    is_prod,
                )?),
                issuer: get_env("JWT_ISSUER", Some("aaa-service"), is_prod)?,
                audience: std::env::var("JWT_AUDIENCE").ok(),
                access_token_expiry_minutes: parse(get_env(
                    "JWT_ACCESS_TOKEN_EXPIRY_MINUTES",
                    Some("15"),
                    is_prod,
                )?)?,
                refresh_token_expiry_days: parse(get_env(
                    "JWT_REFRESH_TOKEN_EXPIRY_DAYS",
                    Some("7"),
                    is_prod,
                )?)?,
                leeway_seconds: parse(get_env("JWT_LEEWAY_SECONDS", Some("120"), is_prod)?)?,
            },
            cache: CacheConfig {
                perm_ttl_seconds: parse(get_env("CACHE_PERM_TTL_SECONDS", Some("300"), is_prod)?)?,
                sweep_interval_seconds: parse(get_env(
                    "CACHE_SWEEP_INTERVAL_SECONDS",
                    Some("60"),
                    is_prod,
                )?)?,
            },
            audit: AuditConfig {
                high_watermark: parse(get_env("AUDIT_HIGH_WATERMARK", Some("1024"), is_prod)?)?,
                retention_days: parse(get_env("AUDIT_RETENTION_DAYS", Some("90"), is_prod)?)?,
            },
            policy_file: std::env::var("SERVICE_POLICY_FILE").ok().map(PathBuf::from),
            rate_limit: RateLimitConfig {
                global_ip_limit: parse(get_env("RATE_LIMIT_GLOBAL_IP_LIMIT", Some("100"), is_prod)?)?,
                global_ip_window_seconds: parse(get_env(
                    "RATE_LIMIT_GLOBAL_IP_WINDOW_SECONDS",
                    Some("60"),
                    is_prod,
                )?)?,
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
        if self.jwt.access_token_expiry_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_ACCESS_TOKEN_EXPIRY_MINUTES must be positive"
            )));
        }
        if self.jwt.refresh_token_expiry_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_REFRESH_TOKEN_EXPIRY_DAYS must be positive"
            )));
        }
        if self.audit.retention_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "AUDIT_RETENTION_DAYS must be positive"
            )));
        }
        if self.environment == Environment::Prod {
            use secrecy::ExposeSecret;
            if self.jwt.secret.expose_secret().len() < 32 {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "JWT_SECRET must be at least 32 bytes in production"
                )));
            }
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(value: String) -> Result<T, AppError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}", e)))
}
