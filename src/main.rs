use actix_web::{App, HttpServer};
use tcode_player::{config::PlayerConfig, routes, tcode::player};
use env_logger::Env;
use dotenv::dotenv;
use log::{error, info};
use std::env;

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:5441";

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init_from_env(Env::default().default_filter_or("info"));

    let config = PlayerConfig::from_env().map_err(|e| {
        error!("{}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
    })?;
    player::initialize_player(config)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    let bind_address = env::var("TCODE_BIND").unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());
    info!("Listening on {}", bind_address);
    let result = HttpServer::new(|| {
        App::new()
            .configure(routes::setup_routes)
    })
    .bind(bind_address)?
    .run()
    .await;

    player::shutdown_player();
    result
}
