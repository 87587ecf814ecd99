mod classification;
mod config;
mod db;
mod inference;
mod routes;
mod storage;

use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use config::{AppConfig, RemoteConfig};
use db::classification_repository::ClassificationRepository;
use routes::configure_routes;
use std::env;
use std::path::Path;
use storage::asset_service::AssetService;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    dotenv::dotenv().ok();

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    } else {
        log::error!("Failed to get the current working directory.");
    }

    let app_config = AppConfig::from_env();

    // Surface a misconfigured inference service early; classification runs
    // re-check on their own and record config_error per delivery.
    if let Err(e) = RemoteConfig::from_env().validate() {
        log::warn!("inference service not fully configured: {e}");
    }

    let pool = db::init_pool(Path::new(&app_config.database_path))
        .await
        .map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Database initialization failed: {e}"),
            )
        })?;
    let repo = ClassificationRepository::new(pool);

    let storage = AssetService::new(&app_config.asset_root).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("Asset root initialization failed: {e}"),
        )
    })?;
    let asset_root = storage.asset_root().to_path_buf();

    let bind_address = format!("0.0.0.0:{}", app_config.port);
    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::AUTHORIZATION,
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(3600),
            )
            .app_data(web::Data::new(repo.clone()))
            .app_data(web::Data::new(storage.clone()))
            .configure(|cfg| configure_routes(cfg, asset_root.clone()))
    })
    .bind(&bind_address)?
    .run()
    .await
}
