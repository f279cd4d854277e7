use crate::auth::types::{Claims, SessionUser, User};
use crate::config::{check_secret, ConfigError, Environment};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::{debug, error, info};
use thiserror::Error;
use uuid::Uuid;

/// 会话有效期 7 天
pub const SESSION_TTL_DAYS: i64 = 7;

#[derive(Debug, Error)]
pub enum TokenError {
    /// 签名错误、格式错误、已过期统一归为此类
    #[error("无效的会话 token")]
    Invalid,

    #[error("生成 token 失败: {0}")]
    Encoding(String),
}

#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenService {
    pub fn new(secret: &str, environment: Environment) -> Result<Self, ConfigError> {
        if secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        check_secret(secret, environment)?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        info!("初始化 token 服务，有效期 {} 天", SESSION_TTL_DAYS);
        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl: Duration::days(SESSION_TTL_DAYS),
        })
    }

    pub fn issue(&self, user: &User) -> Result<String, TokenError> {
        self.issue_at(user, Utc::now())
    }

    pub fn issue_at(&self, user: &User, now: DateTime<Utc>) -> Result<String, TokenError> {
        debug!("为用户 {} 生成 JWT token", user.id);
        let claims = Claims {
            user_id: user.id.clone(),
            email: user.email.clone(),
            role: user.role,
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key).map_err(|e| {
            error!("为用户 {} 生成 token 失败: {}", user.id, e);
            TokenError::Encoding(e.to_string())
        })
    }

    pub fn validate(&self, token: &str) -> Result<SessionUser, TokenError> {
        debug!("验证 JWT token");
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims.into())
            .map_err(|e| {
                debug!("Token 验证失败: {}", e);
                TokenError::Invalid
            })
    }
}
