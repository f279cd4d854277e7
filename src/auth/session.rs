use actix_web::cookie::{time::Duration as CookieDuration, Cookie, SameSite};
use actix_web::HttpRequest;
use log::{debug, warn};
use std::net::IpAddr;

use super::jwt::{TokenService, SESSION_TTL_DAYS};
use super::types::{Role, SessionUser};
use crate::errors::ApiError;

pub const SESSION_COOKIE: &str = "session";

pub fn session_cookie(token: &str, secure: bool) -> Cookie<'static> {
    Cookie::build(SESSION_COOKIE, token.to_string())
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(CookieDuration::days(SESSION_TTL_DAYS))
        .path("/")
        .finish()
}

/// 空值加 Max-Age=0
pub fn clear_session_cookie(secure: bool) -> Cookie<'static> {
    Cookie::build(SESSION_COOKIE, "")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(CookieDuration::ZERO)
        .path("/")
        .finish()
}

/// 请求中非空的 session cookie 值
pub fn session_token(req: &HttpRequest) -> Option<String> {
    req.cookie(SESSION_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}

pub enum SessionState {
    Missing,
    Invalid,
    Valid(SessionUser),
}

/// 完整校验签名和有效期
pub fn session_state(req: &HttpRequest, tokens: &TokenService) -> SessionState {
    match session_token(req) {
        None => SessionState::Missing,
        Some(token) => match tokens.validate(&token) {
            Ok(user) => SessionState::Valid(user),
            Err(e) => {
                debug!("会话无效: {}", e);
                SessionState::Invalid
            }
        },
    }
}

/// 管理员接口的授权判断；调用方负责在 `Invalid` 时清除 cookie
pub fn require_admin(state: SessionState) -> Result<SessionUser, ApiError> {
    let user = match state {
        SessionState::Valid(user) => user,
        SessionState::Missing | SessionState::Invalid => return Err(ApiError::Unauthenticated),
    };
    match user.role {
        Role::Admin => Ok(user),
        Role::User => {
            warn!("用户 {} 没有管理员权限", user.id);
            Err(ApiError::Forbidden)
        }
    }
}

/// 限流用的客户端标识：X-Forwarded-For 第一个地址、X-Real-IP、对端地址
pub fn client_identifier(req: &HttpRequest) -> String {
    let header_ip = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|ip| ip.parse::<IpAddr>().is_ok())
            .map(str::to_string)
    };

    if let Some(ip) = header_ip("x-forwarded-for").or_else(|| header_ip("x-real-ip")) {
        return ip;
    }
    if let Some(addr) = req.peer_addr() {
        return addr.ip().to_string();
    }
    warn!("无法确定客户端 IP");
    "unknown".to_string()
}
