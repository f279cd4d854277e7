use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// 未配置 JWT_SECRET 时使用的开发密钥，生产环境禁止使用
pub const DEV_JWT_SECRET: &str = "your-secret-key-change-in-production";

/// 生产环境要求的最短密钥长度（字节）
pub const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("生产环境必须设置 JWT_SECRET")]
    MissingSecret,

    #[error("生产环境的 JWT_SECRET 不安全: {0}")]
    InsecureSecret(String),

    #[error("配置项 {key} 的值无效: {value}")]
    Invalid { key: String, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(ConfigError::Invalid {
                key: "APP_ENV".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// 限流相关时长（秒）的上限：30 天
pub const MAX_RATE_LIMIT_SECS: u64 = 30 * 24 * 3600;

/// 登录限流参数
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_attempts: u32,
    pub attempt_window: chrono::Duration,
    pub block_duration: chrono::Duration,
    pub cleanup_interval: std::time::Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            attempt_window: chrono::Duration::minutes(15),
            block_duration: chrono::Duration::minutes(15),
            cleanup_interval: std::time::Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub jwt_secret: String,
    pub bind_addr: SocketAddr,
    pub log_dir: PathBuf,
    pub log_level: log::LevelFilter,
    pub public_dir: PathBuf,
    pub rate_limit: RateLimitConfig,
}

impl AppConfig {
    /// 从进程环境变量读取配置
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = match lookup("APP_ENV") {
            Some(v) => v.parse()?,
            None => Environment::Development,
        };
        debug!("运行环境: {:?}", environment);

        let jwt_secret = resolve_secret(lookup("JWT_SECRET"), environment)?;

        let bind_addr = parse_or("BIND_ADDR", lookup("BIND_ADDR"), "0.0.0.0:8080")?;
        let log_dir = PathBuf::from(lookup("LOG_DIR").unwrap_or_else(|| "logs".to_string()));
        let log_level = parse_or("LOG_LEVEL", lookup("LOG_LEVEL"), "debug")?;
        let public_dir =
            PathBuf::from(lookup("PUBLIC_DIR").unwrap_or_else(|| "public".to_string()));

        let defaults = RateLimitConfig::default();
        let rate_limit = RateLimitConfig {
            max_attempts: parse_or(
                "RATE_LIMIT_MAX_ATTEMPTS",
                lookup("RATE_LIMIT_MAX_ATTEMPTS"),
                &defaults.max_attempts.to_string(),
            )?,
            attempt_window: chrono::Duration::seconds(parse_secs(
                "RATE_LIMIT_WINDOW_SECS",
                lookup("RATE_LIMIT_WINDOW_SECS"),
                defaults.attempt_window.num_seconds() as u64,
            )? as i64),
            block_duration: chrono::Duration::seconds(parse_secs(
                "RATE_LIMIT_BLOCK_SECS",
                lookup("RATE_LIMIT_BLOCK_SECS"),
                defaults.block_duration.num_seconds() as u64,
            )? as i64),
            cleanup_interval: std::time::Duration::from_secs(parse_secs(
                "RATE_LIMIT_CLEANUP_SECS",
                lookup("RATE_LIMIT_CLEANUP_SECS"),
                defaults.cleanup_interval.as_secs(),
            )?),
        };

        if rate_limit.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "RATE_LIMIT_MAX_ATTEMPTS".to_string(),
                value: "0".to_string(),
            });
        }

        info!(
            "配置加载完成 - 环境: {:?}, 监听: {}, 限流: {} 次/{} 秒",
            environment,
            bind_addr,
            rate_limit.max_attempts,
            rate_limit.attempt_window.num_seconds()
        );

        Ok(Self {
            environment,
            jwt_secret,
            bind_addr,
            log_dir,
            log_level,
            public_dir,
            rate_limit,
        })
    }
}

/// 校验签名密钥；生产环境下缺失或使用默认值直接失败
pub fn check_secret(secret: &str, environment: Environment) -> Result<(), ConfigError> {
    if !environment.is_production() {
        return Ok(());
    }
    if secret == DEV_JWT_SECRET {
        return Err(ConfigError::InsecureSecret("使用了开发默认密钥".to_string()));
    }
    if secret.len() < MIN_SECRET_LEN {
        return Err(ConfigError::InsecureSecret(format!(
            "长度不足 {} 字节",
            MIN_SECRET_LEN
        )));
    }
    Ok(())
}

fn resolve_secret(raw: Option<String>, environment: Environment) -> Result<String, ConfigError> {
    let secret = match raw.filter(|s| !s.trim().is_empty()) {
        Some(secret) => secret,
        None if environment.is_production() => return Err(ConfigError::MissingSecret),
        None => {
            warn!(
                "未设置 JWT_SECRET，使用开发默认密钥 (指纹 {})",
                secret_fingerprint(DEV_JWT_SECRET)
            );
            DEV_JWT_SECRET.to_string()
        }
    };
    check_secret(&secret, environment)?;
    Ok(secret)
}

/// 密钥的 SHA-256 前 8 字节，只用于日志
pub fn secret_fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: &str) -> Result<T, ConfigError> {
    let value = raw.unwrap_or_else(|| default.to_string());
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value,
    })
}

/// 正整数秒，范围 1..=MAX_RATE_LIMIT_SECS
fn parse_secs(key: &str, raw: Option<String>, default: u64) -> Result<u64, ConfigError> {
    let secs: u64 = parse_or(key, raw, &default.to_string())?;
    if secs == 0 || secs > MAX_RATE_LIMIT_SECS {
        return Err(ConfigError::Invalid {
            key: key.to_string(),
            value: secs.to_string(),
        });
    }
    Ok(secs)
}
