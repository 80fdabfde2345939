use actix_web::{HttpResponse, HttpServer, get, post, web};

use crate::config::ProxyConfig;
use crate::error::DispatchError;
use crate::io_struct::CompletionRequest;
use crate::lb_state::ProxyState;
use crate::logging::init_logging;
use crate::strategy_lb::EngineType;

#[post("/v1/completions")]
pub async fn completions(
    req: web::Json<CompletionRequest>,
    app_state: web::Data<ProxyState>,
) -> Result<HttpResponse, DispatchError> {
    app_state.dispatch("/completions", req.into_inner()).await
}

#[post("/v1/chat/completions")]
pub async fn chat_completions(
    req: web::Json<CompletionRequest>,
    app_state: web::Data<ProxyState>,
) -> Result<HttpResponse, DispatchError> {
    app_state
        .dispatch("/chat/completions", req.into_inner())
        .await
}

#[get("/healthcheck")]
pub async fn healthcheck(app_state: web::Data<ProxyState>) -> HttpResponse {
    HttpResponse::Ok().json(app_state.healthcheck())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(completions)
        .service(chat_completions)
        .service(healthcheck);
}

pub fn json_config(max_payload_size: usize) -> web::JsonConfig {
    web::JsonConfig::default().limit(max_payload_size)
}

pub async fn startup(config: ProxyConfig) -> anyhow::Result<()> {
    init_logging(config.log_level);

    let app_state = web::Data::new(ProxyState::new(&config)?);
    let pool = &app_state.pool;
    log::info!(
        "[PROXY_INIT] Starting proxy server on {}:{}",
        config.host,
        config.port
    );
    for role in [EngineType::Prefill, EngineType::Decode] {
        let instances = pool
            .role(role)
            .engines()
            .iter()
            .map(|e| e.address())
            .collect::<Vec<_>>();
        log::info!(
            "[PROXY_CONFIG] {} instances ({}): {}",
            role,
            pool.role(role).policy_name(),
            instances.join(", ")
        );
    }

    let max_payload_size = config.max_payload_size;
    let server_state = app_state.clone();
    HttpServer::new(move || {
        actix_web::App::new()
            .wrap(actix_web::middleware::Logger::default())
            .app_data(server_state.clone())
            .app_data(json_config(max_payload_size))
            .configure(configure)
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await?;

    app_state.pool.close_all();
    log::info!("Proxy server stopped");
    Ok(())
}
