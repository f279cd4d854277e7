use actix_web::{http::header, web, HttpRequest, HttpResponse};
use log::{error, warn};

use crate::auth::middleware::{HOME_PATH, SIGNIN_PATH};
use crate::auth::session::{clear_session_cookie, session_state, SessionState};
use crate::auth::Role;
use crate::AppState;

const ADMIN_PLACEHOLDER: &str =
    "<!doctype html><html><head><title>Admin Dashboard</title></head><body><h1>Admin Dashboard</h1></body></html>";

fn redirect(location: &str) -> HttpResponse {
    HttpResponse::TemporaryRedirect()
        .insert_header((header::LOCATION, location))
        .finish()
}

fn redirect_and_clear(location: &str, secure: bool) -> HttpResponse {
    HttpResponse::TemporaryRedirect()
        .insert_header((header::LOCATION, location))
        .cookie(clear_session_cookie(secure))
        .finish()
}

/// 管理后台页面：未登录去登录页，非管理员回首页
pub async fn admin_page(req: HttpRequest, data: web::Data<AppState>) -> HttpResponse {
    let session = match session_state(&req, &data.tokens) {
        SessionState::Valid(session) => session,
        SessionState::Missing => return redirect(SIGNIN_PATH),
        SessionState::Invalid => return redirect_and_clear(SIGNIN_PATH, data.secure_cookies),
    };

    // 角色以存储中的当前值为准
    let user = match data.credentials.find_by_id(&session.id).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            warn!("会话中的用户 {} 已不存在", session.id);
            return redirect_and_clear(SIGNIN_PATH, data.secure_cookies);
        }
        Err(e) => {
            error!("查询用户 {} 失败: {}", session.id, e);
            return HttpResponse::InternalServerError().finish();
        }
    };

    match user.role {
        Role::Admin => HttpResponse::Ok()
            .content_type("text/html; charset=utf-8")
            .body(ADMIN_PLACEHOLDER),
        Role::User => {
            warn!("用户 {} 尝试访问 {}", user.id, req.path());
            redirect(HOME_PATH)
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/admin", web::get().to(admin_page))
        .route("/admin/{tail:.*}", web::get().to(admin_page));
}
