// src/handlers/device.rs

//! Device port endpoints
//!
//! Opening a serial port and stopping the control loop both block briefly, so
//! they run on the blocking thread pool.

use log::{info, error};
use actix_web::{web, HttpResponse};
use crate::tcode::player;
use super::types::{ErrorResponse, OpenPortRequest};

/// Returns playback state, open port, loaded tracks and channel status
pub async fn handle_device_status() -> HttpResponse {
    match player::with_player(|player| player.status()) {
        Ok(status) => HttpResponse::Ok().json(status),
        Err(e) => {
            error!("Failed to read player status: {}", e);
            HttpResponse::InternalServerError().json(ErrorResponse::new(e))
        }
    }
}

/// Opens the device port named in the body, or the configured one
///
/// # Returns
/// * `HttpResponse` - Player status after opening
/// * Returns 409 if the port cannot be opened
pub async fn handle_open_device(body: Option<web::Json<OpenPortRequest>>) -> HttpResponse {
    let port = body.and_then(|b| b.into_inner().port);

    let result = web::block(move || {
        player::with_player(|player| {
            player
                .open_port(port.as_deref())
                .map(|description| (description, player.status()))
        })
    })
    .await;

    match result {
        Ok(Ok(Ok((description, status)))) => {
            info!("Device opened on {}", description);
            HttpResponse::Ok().json(status)
        }
        Ok(Ok(Err(e))) => {
            error!("{}", e);
            HttpResponse::Conflict().json(ErrorResponse::new(e))
        }
        Ok(Err(e)) => HttpResponse::InternalServerError().json(ErrorResponse::new(e)),
        Err(e) => HttpResponse::InternalServerError().json(ErrorResponse::new(e.to_string())),
    }
}

/// Stops playback and closes the device port
pub async fn handle_close_device() -> HttpResponse {
    let result = web::block(|| {
        player::with_player(|player| player.close_port().map(|()| player.status()))
    })
    .await;

    match result {
        Ok(Ok(Ok(status))) => HttpResponse::Ok().json(status),
        Ok(Ok(Err(e))) | Ok(Err(e)) => {
            error!("Failed to close device: {}", e);
            HttpResponse::InternalServerError().json(ErrorResponse::new(e))
        }
        Err(e) => HttpResponse::InternalServerError().json(ErrorResponse::new(e.to_string())),
    }
}
