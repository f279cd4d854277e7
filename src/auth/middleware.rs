use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header,
    Error, HttpResponse,
};
use futures::future::{ready, LocalBoxFuture, Ready};
use log::debug;
use regex::Regex;
use std::sync::OnceLock;

use super::session::SESSION_COOKIE;

pub const SIGNIN_PATH: &str = "/auth/signin";
pub const HOME_PATH: &str = "/";

const PUBLIC_PATHS: &[&str] = &[
    "/",
    SIGNIN_PATH,
    "/about",
    "/blog",
    "/shop",
    "/privacy-policy",
    "/terms-and-conditions",
    "/refund-policy",
];

const PUBLIC_PREFIXES: &[&str] = &["/blog/", "/shop/"];

// API 路由自己做授权，静态资源直接放行
const BYPASS_PREFIXES: &[&str] = &["/api/", "/_next/", "/static/", "/images/"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClass {
    Bypass,
    Public,
    Protected,
}

fn file_extension_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\.[A-Za-z0-9]+$").expect("静态正则表达式"))
}

pub fn classify_path(path: &str) -> PathClass {
    let last_segment = path.rsplit('/').next().unwrap_or("");
    if path == "/api"
        || BYPASS_PREFIXES.iter().any(|p| path.starts_with(p))
        || file_extension_regex().is_match(last_segment)
    {
        return PathClass::Bypass;
    }
    if PUBLIC_PATHS.contains(&path) || PUBLIC_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return PathClass::Public;
    }
    PathClass::Protected
}

#[derive(Debug, PartialEq, Eq)]
enum GateDecision {
    Pass,
    Redirect(&'static str),
}

/// 只看 cookie 是否存在；签名和角色在具体页面或接口里校验
fn decide(path: &str, has_session: bool) -> GateDecision {
    match classify_path(path) {
        PathClass::Bypass => GateDecision::Pass,
        PathClass::Protected if !has_session => GateDecision::Redirect(SIGNIN_PATH),
        _ if path == SIGNIN_PATH && has_session => GateDecision::Redirect(HOME_PATH),
        _ => GateDecision::Pass,
    }
}

#[derive(Clone, Default)]
pub struct AuthGate;

impl AuthGate {
    pub fn new() -> Self {
        AuthGate
    }
}

impl<S, B> Transform<S, ServiceRequest> for AuthGate
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = AuthGateService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AuthGateService { service }))
    }
}

pub struct AuthGateService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for AuthGateService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let has_session = req
            .cookie(SESSION_COOKIE)
            .map(|c| !c.value().is_empty())
            .unwrap_or(false);

        match decide(req.path(), has_session) {
            GateDecision::Pass => {
                let fut = self.service.call(req);
                Box::pin(async move { fut.await.map(ServiceResponse::map_into_left_body) })
            }
            GateDecision::Redirect(location) => {
                debug!("重定向 {} -> {}", req.path(), location);
                let response = HttpResponse::TemporaryRedirect()
                    .insert_header((header::LOCATION, location))
                    .finish();
                let res = req.into_response(response).map_into_right_body();
                Box::pin(async move { Ok(res) })
            }
        }
    }
}
