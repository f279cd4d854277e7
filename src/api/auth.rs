use actix_web::{web, HttpRequest, HttpResponse, ResponseError};
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use validator::Validate;

use crate::auth::session::{
    clear_session_cookie, client_identifier, require_admin, session_cookie, session_state,
    SessionState,
};
use crate::auth::{AttemptRecord, RateLimitDecision};
use crate::errors::ApiError;
use crate::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct SignInRequest {
    #[serde(default)]
    #[validate(email(message = "Invalid email address"))]
    pub email: String,
    #[serde(default)]
    #[validate(length(max = 1024, message = "Password is too long"))]
    pub password: String,
}

fn parse_credentials(body: &[u8]) -> Result<SignInRequest, ApiError> {
    let request: SignInRequest = serde_json::from_slice(body).map_err(|e| {
        debug!("登录请求体解析失败: {}", e);
        ApiError::Validation("Email and password are required".to_string())
    })?;

    if request.email.trim().is_empty() || request.password.is_empty() {
        return Err(ApiError::Validation(
            "Email and password are required".to_string(),
        ));
    }

    request.validate().map_err(|errors| {
        let message = errors
            .field_errors()
            .values()
            .flat_map(|errs| errs.iter())
            .filter_map(|e| e.message.as_ref().map(|m| m.to_string()))
            .next()
            .unwrap_or_else(|| "Invalid request".to_string());
        ApiError::Validation(message)
    })?;

    Ok(request)
}

// POST /api/auth/signin
pub async fn signin(
    req: HttpRequest,
    body: web::Bytes,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let client_id = client_identifier(&req);
    info!("收到登录请求 (客户端: {})", client_id);

    if let RateLimitDecision::Denied { retry_after_secs } =
        data.rate_limiter.check_limit(&client_id)
    {
        return Err(ApiError::RateLimited {
            retry_after: retry_after_secs,
        });
    }

    let credentials = parse_credentials(&body)?;

    // 并发请求在这里争抢剩余次数，预占成功才做密码校验
    if let RateLimitDecision::Denied { retry_after_secs } =
        data.rate_limiter.try_begin_attempt(&client_id)
    {
        return Err(ApiError::RateLimited {
            retry_after: retry_after_secs,
        });
    }

    let user = data
        .credentials
        .authenticate(&credentials.email, &credentials.password)
        .await
        .map_err(|e| ApiError::Internal(format!("凭据查询失败: {}", e)))?;

    let Some(user) = user else {
        warn!("客户端 {} 登录失败", client_id);
        return Err(ApiError::Authentication);
    };

    data.rate_limiter.reset_attempts(&client_id);

    let token = data
        .tokens
        .issue(&user)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    info!("用户 {} 登录成功", user.id);
    Ok(HttpResponse::Ok()
        .cookie(session_cookie(&token, data.secure_cookies))
        .json(json!({
            "success": true,
            "user": user,
        })))
}

// GET /api/auth/session
pub async fn session(req: HttpRequest, data: web::Data<AppState>) -> HttpResponse {
    match session_state(&req, &data.tokens) {
        SessionState::Valid(user) => HttpResponse::Ok().json(json!({ "user": user })),
        SessionState::Missing => HttpResponse::Ok().json(json!({ "user": null })),
        SessionState::Invalid => {
            warn!("会话 token 无效，清除 cookie");
            HttpResponse::Ok()
                .cookie(clear_session_cookie(data.secure_cookies))
                .json(json!({ "user": null }))
        }
    }
}

// POST /api/auth/signout
pub async fn signout(data: web::Data<AppState>) -> HttpResponse {
    debug!("用户登出，清除会话 cookie");
    HttpResponse::Ok()
        .cookie(clear_session_cookie(data.secure_cookies))
        .json(json!({ "success": true }))
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub ip: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AttemptView {
    ip: String,
    attempts: u32,
    first_attempt: String,
    last_attempt: String,
}

impl AttemptView {
    fn new(ip: String, record: &AttemptRecord) -> Self {
        Self {
            ip,
            attempts: record.count,
            first_attempt: iso(record.first_attempt),
            last_attempt: iso(record.last_attempt),
        }
    }
}

fn iso(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// GET /api/auth/rate-limit-status
pub async fn rate_limit_status(
    req: HttpRequest,
    query: web::Query<StatusQuery>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let admin = match session_state(&req, &data.tokens) {
        SessionState::Invalid => {
            warn!("会话 token 无效，清除 cookie");
            let mut resp = ApiError::Unauthenticated.error_response();
            resp.add_cookie(&clear_session_cookie(data.secure_cookies))
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            return Ok(resp);
        }
        state => require_admin(state)?,
    };

    let blocked: Vec<AttemptView> = data
        .rate_limiter
        .get_all_blocked()
        .into_iter()
        .map(|b| AttemptView::new(b.client_id, &b.record))
        .collect();
    info!(
        "管理员 {} 查询限流状态：{} 个被封禁，{} 条记录",
        admin.id,
        blocked.len(),
        data.rate_limiter.len()
    );

    let mut body = json!({ "blockedIPs": blocked });
    if let Some(ip) = query.ip.as_deref().filter(|ip| !ip.is_empty()) {
        let client = data
            .rate_limiter
            .status(ip)
            .map(|record| AttemptView::new(ip.to_string(), &record));
        body["client"] = serde_json::to_value(client).map_err(|e| {
            error!("序列化限流状态失败: {}", e);
            ApiError::Internal(e.to_string())
        })?;
    }

    Ok(HttpResponse::Ok().json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::middleware::AuthGate;
    use crate::auth::store::{InMemoryCredentialStore, MockCredentialStore, StoreError, TEST_COST};
    use crate::auth::{CredentialStore, RateLimiter, TokenService, SESSION_COOKIE};
    use crate::config::{Environment, RateLimitConfig};
    use actix_web::{
        cookie::Cookie,
        dev::ServiceResponse,
        http::{header, StatusCode},
        test, App,
    };
    use chrono::Duration;
    use futures::future::join_all;
    use serde_json::Value;
    use std::sync::Arc;

    const IP: &str = "1.2.3.4";

    fn state_with(store: Arc<dyn CredentialStore>) -> web::Data<AppState> {
        web::Data::new(AppState {
            credentials: store,
            rate_limiter: Arc::new(RateLimiter::new(RateLimitConfig::default())),
            tokens: TokenService::new("api-test-secret", Environment::Test).unwrap(),
            secure_cookies: false,
        })
    }

    fn state() -> web::Data<AppState> {
        state_with(Arc::new(
            InMemoryCredentialStore::seeded_with_cost(TEST_COST).unwrap(),
        ))
    }

    macro_rules! app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data($state.clone())
                    .wrap(AuthGate::new())
                    .configure(crate::api::configure)
                    .configure(crate::pages::configure),
            )
            .await
        };
    }

    fn signin_req(email: &str, password: &str) -> test::TestRequest {
        test::TestRequest::post()
            .uri("/api/auth/signin")
            .insert_header(("x-forwarded-for", IP))
            .set_json(json!({ "email": email, "password": password }))
    }

    fn session_cookie_of<B>(resp: &ServiceResponse<B>) -> Option<Cookie<'static>> {
        resp.response()
            .cookies()
            .find(|c| c.name() == SESSION_COOKIE)
            .map(|c| c.into_owned())
    }

    #[actix_web::test]
    async fn signin_success_sets_cookie_and_returns_user() {
        let state = state();
        let app = app!(state);

        let resp = test::call_service(&app, signin_req("admin@example.com", "admin123").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let cookie = session_cookie_of(&resp).unwrap();
        assert!(!cookie.value().is_empty());
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.max_age(), Some(actix_web::cookie::time::Duration::days(7)));

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["user"]["id"], "admin-1");
        assert_eq!(body["user"]["role"], "admin");
        assert!(body["user"].get("password").is_none());
    }

    #[actix_web::test]
    async fn signin_missing_fields_is_400() {
        let state = state();
        let app = app!(state);

        let resp = test::call_service(&app, signin_req("", "x").to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "Email and password are required");

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/api/auth/signin")
                .insert_header((header::CONTENT_TYPE, "application/json"))
                .set_payload("{not json")
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = test::call_service(&app, signin_req("not-an-email", "x").to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        // 参数错误不计入失败次数
        assert!(state.rate_limiter.status(IP).is_none());
    }

    #[actix_web::test]
    async fn unknown_email_and_wrong_password_look_identical() {
        let state = state();
        let app = app!(state);

        let a = test::call_service(&app, signin_req("ghost@example.com", "admin123").to_request()).await;
        let b = test::call_service(&app, signin_req("admin@example.com", "wrong").to_request()).await;
        assert_eq!(a.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(b.status(), StatusCode::UNAUTHORIZED);
        let a: Value = test::read_body_json(a).await;
        let b: Value = test::read_body_json(b).await;
        assert_eq!(a, b);
        assert_eq!(a["error"], "Invalid email or password");
        assert_eq!(state.rate_limiter.status(IP).unwrap().count, 2);
    }

    #[actix_web::test]
    async fn sixth_attempt_is_rate_limited() {
        let state = state();
        let app = app!(state);

        for _ in 0..5 {
            let resp = test::call_service(&app, signin_req("admin@example.com", "bad").to_request()).await;
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        }

        // 即使密码正确也被拒绝
        let resp = test::call_service(&app, signin_req("admin@example.com", "admin123").to_request()).await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(resp.headers().contains_key(header::RETRY_AFTER));
        let body: Value = test::read_body_json(resp).await;
        let retry = body["retryAfter"].as_u64().unwrap();
        assert!((890..=900).contains(&retry), "retryAfter={}", retry);

        // 其他客户端不受影响
        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/api/auth/signin")
                .insert_header(("x-forwarded-for", "5.6.7.8"))
                .set_json(json!({ "email": "admin@example.com", "password": "admin123" }))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn signin_after_block_expiry_succeeds_and_clears_record() {
        let state = state();
        let app = app!(state);

        let start = Utc::now() - Duration::minutes(17);
        for i in 0..5 {
            state
                .rate_limiter
                .record_failed_attempt_at(IP, start + Duration::seconds(i * 10));
        }

        let resp = test::call_service(&app, signin_req("admin@example.com", "admin123").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state.rate_limiter.status(IP).is_none());
    }

    #[actix_web::test]
    async fn success_resets_prior_failures() {
        let state = state();
        let app = app!(state);

        for _ in 0..4 {
            test::call_service(&app, signin_req("user@example.com", "bad").to_request()).await;
        }
        assert_eq!(state.rate_limiter.status(IP).unwrap().count, 4);

        let resp = test::call_service(&app, signin_req("user@example.com", "user123").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state.rate_limiter.status(IP).is_none());
        assert!(state.rate_limiter.check_limit(IP).is_allowed());
    }

    #[actix_web::test]
    async fn store_failure_is_500_without_detail() {
        let mut store = MockCredentialStore::new();
        store
            .expect_authenticate()
            .returning(|_, _| Err(StoreError::Unavailable("db-primary:5432 refused".to_string())));
        let state = state_with(Arc::new(store));
        let app = app!(state);

        let resp = test::call_service(&app, signin_req("admin@example.com", "admin123").to_request()).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body, json!({ "error": "Internal server error" }));
        // 预占的那次尝试保留
        assert_eq!(state.rate_limiter.status(IP).unwrap().count, 1);
    }

    #[actix_web::test]
    async fn session_endpoint_reports_and_clears() {
        let state = state();
        let app = app!(state);

        let resp = test::call_service(&app, test::TestRequest::get().uri("/api/auth/session").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body, json!({ "user": null }));

        let resp = test::call_service(&app, signin_req("user@example.com", "user123").to_request()).await;
        let cookie = session_cookie_of(&resp).unwrap();
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/api/auth/session")
                .cookie(cookie)
                .to_request(),
        )
        .await;
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["user"]["id"], "user-1");
        assert_eq!(body["user"]["email"], "user@example.com");
        assert_eq!(body["user"]["role"], "user");

        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/api/auth/session")
                .cookie(Cookie::new(SESSION_COOKIE, "tampered.token.value"))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let cleared = session_cookie_of(&resp).unwrap();
        assert_eq!(cleared.value(), "");
        assert_eq!(cleared.max_age(), Some(actix_web::cookie::time::Duration::ZERO));
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body, json!({ "user": null }));
    }

    #[actix_web::test]
    async fn signout_clears_cookie() {
        let state = state();
        let app = app!(state);

        let resp = test::call_service(&app, test::TestRequest::post().uri("/api/auth/signout").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(session_cookie_of(&resp).unwrap().value(), "");
    }

    #[actix_web::test]
    async fn rate_limit_status_requires_admin() {
        let state = state();
        let app = app!(state);

        for _ in 0..5 {
            state.rate_limiter.record_failed_attempt("9.9.9.9");
        }
        state.rate_limiter.record_failed_attempt("8.8.8.8");

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/api/auth/rate-limit-status").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = test::call_service(&app, signin_req("user@example.com", "user123").to_request()).await;
        let user_cookie = session_cookie_of(&resp).unwrap();
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/api/auth/rate-limit-status")
                .cookie(user_cookie)
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = test::call_service(&app, signin_req("admin@example.com", "admin123").to_request()).await;
        let admin_cookie = session_cookie_of(&resp).unwrap();
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/api/auth/rate-limit-status?ip=8.8.8.8")
                .cookie(admin_cookie)
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        let blocked = body["blockedIPs"].as_array().unwrap();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0]["ip"], "9.9.9.9");
        assert_eq!(blocked[0]["attempts"], 5);
        assert!(blocked[0]["firstAttempt"].as_str().unwrap().ends_with('Z'));
        assert_eq!(body["client"]["attempts"], 1);
    }

    #[actix_web::test]
    async fn parallel_bad_signins_are_bounded_by_max_attempts() {
        let state = state();
        let app = app!(state);

        let responses = join_all(
            (0..20).map(|_| test::call_service(&app, signin_req("admin@example.com", "bad").to_request())),
        )
        .await;

        let unauthorized = responses
            .iter()
            .filter(|r| r.status() == StatusCode::UNAUTHORIZED)
            .count();
        let limited = responses
            .iter()
            .filter(|r| r.status() == StatusCode::TOO_MANY_REQUESTS)
            .count();
        assert_eq!(unauthorized, 5);
        assert_eq!(limited, 15);
        assert_eq!(state.rate_limiter.status(IP).unwrap().count, 5);
    }

    #[actix_web::test]
    async fn rate_limit_status_clears_expired_session() {
        let state = state();
        let app = app!(state);

        let admin = crate::auth::types::User {
            id: "admin-1".to_string(),
            email: "admin@example.com".to_string(),
            role: crate::auth::Role::Admin,
        };
        let expired = state
            .tokens
            .issue_at(&admin, Utc::now() - Duration::days(8))
            .unwrap();

        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/api/auth/rate-limit-status")
                .cookie(Cookie::new(SESSION_COOKIE, expired))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let cleared = session_cookie_of(&resp).unwrap();
        assert_eq!(cleared.value(), "");
        assert_eq!(cleared.max_age(), Some(actix_web::cookie::time::Duration::ZERO));
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body, json!({ "error": "Unauthorized" }));

        // 没有 cookie 时不下发清除
        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/api/auth/rate-limit-status").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(session_cookie_of(&resp).is_none());
    }
}
