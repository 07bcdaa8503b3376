// src/handlers/config.rs

//! Configuration endpoints
//!
//! The frontend treats the player configuration as an opaque JSON document:
//! it reads it, edits it and writes it back whole.

use log::{info, error};
use actix_web::{web, HttpResponse};
use crate::{config::PlayerConfig, tcode::player};
use super::types::ErrorResponse;

/// Returns the current player configuration
pub async fn handle_get_config() -> HttpResponse {
    match player::with_player(|player| player.config().clone()) {
        Ok(config) => HttpResponse::Ok().json(config),
        Err(e) => {
            error!("Failed to read configuration: {}", e);
            HttpResponse::InternalServerError().json(ErrorResponse::new(e))
        }
    }
}

/// Replaces the player configuration for the running process
///
/// # Returns
/// * `HttpResponse` - The configuration as applied, after clamping
pub async fn handle_put_config(body: web::Json<PlayerConfig>) -> HttpResponse {
    let config = body.into_inner();
    let applied = match player::with_player(move |player| {
        player.apply_config(config);
        player.config().clone()
    }) {
        Ok(applied) => applied,
        Err(e) => {
            error!("Failed to apply configuration: {}", e);
            return HttpResponse::InternalServerError().json(ErrorResponse::new(e));
        }
    };

    info!("Configuration replaced through the API");
    HttpResponse::Ok().json(applied)
}
