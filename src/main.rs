mod api;
mod auth;
mod config;
mod errors;
mod logger;
mod pages;

use actix_cors::Cors;
use actix_files::Files;
use actix_web::{web, App, HttpServer};
use dotenv::dotenv;
use log::{error, info};
use std::io;
use std::sync::Arc;

use auth::{start_cleanup, AuthGate, CredentialStore, InMemoryCredentialStore, RateLimiter, TokenService};
use config::AppConfig;

// 应用状态
pub struct AppState {
    pub credentials: Arc<dyn CredentialStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub tokens: TokenService,
    pub secure_cookies: bool,
}

fn other_err<E: std::fmt::Display>(context: &str, e: E) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("{}: {}", context, e))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // 加载 .env
    dotenv().ok();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            // 日志系统尚未初始化
            eprintln!("配置错误: {}", e);
            return Err(other_err("配置错误", e));
        }
    };

    logger::Logger::init_or_stderr(&config.log_dir, config.log_level);
    info!("应用程序启动");

    let tokens = TokenService::new(&config.jwt_secret, config.environment).map_err(|e| {
        error!("token 服务初始化失败: {}", e);
        other_err("token 服务初始化失败", e)
    })?;

    let credentials = InMemoryCredentialStore::seeded().map_err(|e| {
        error!("用户存储初始化失败: {}", e);
        other_err("用户存储初始化失败", e)
    })?;

    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));

    let app_state = web::Data::new(AppState {
        credentials: Arc::new(credentials),
        rate_limiter: rate_limiter.clone(),
        tokens,
        secure_cookies: config.environment.is_production(),
    });

    // 启动登录失败记录清理任务
    let cleanup = start_cleanup(rate_limiter);

    let public_dir = config.public_dir.clone();
    let serve_static = public_dir.is_dir();
    if !serve_static {
        info!("静态目录 {} 不存在，跳过挂载", public_dir.display());
    }

    info!("服务器启动在 http://{}", config.bind_addr);

    let result = HttpServer::new(move || {
        let mut app = App::new()
            .app_data(app_state.clone())
            .wrap(AuthGate::new())
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header()
                    .max_age(3600),
            )
            .configure(api::configure)
            .configure(pages::configure);
        if serve_static {
            app = app.service(Files::new("/", &public_dir).index_file("index.html"));
        }
        app
    })
    .bind(config.bind_addr)?
    .run()
    .await;

    cleanup.shutdown();
    info!("服务器已停止");
    result
}
