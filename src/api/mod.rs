use actix_web::web;

mod auth;

pub use auth::{rate_limit_status, session, signin, signout};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/auth")
            .route("/signin", web::post().to(signin))
            .route("/session", web::get().to(session))
            .route("/signout", web::post().to(signout))
            .route("/rate-limit-status", web::get().to(rate_limit_status)),
    );
}
