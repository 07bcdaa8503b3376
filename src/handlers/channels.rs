// src/handlers/channels.rs

//! Channel status, manual binding and preview endpoints

use log::{info, warn, error};
use actix_web::{web, HttpResponse};
use crate::tcode::{channel::ChannelId, player, producer::TrackBinding};
use super::types::{ErrorResponse, PreviewRequest, PreviewResponse};

/// Returns every channel's binding and last emitted value
pub async fn handle_channels() -> HttpResponse {
    match player::with_player(|player| player.status().channels) {
        Ok(channels) => HttpResponse::Ok().json(channels),
        Err(e) => {
            error!("Failed to read channel status: {}", e);
            HttpResponse::InternalServerError().json(ErrorResponse::new(e))
        }
    }
}

/// Binds a channel by hand
///
/// # Arguments
/// * `path` - Channel id, e.g. `L0`
/// * `body` - `{"mode":"track","track":1}`, `{"mode":"auto"}` or `{"mode":"disabled"}`
///
/// # Returns
/// * `HttpResponse` - Channel status after the change
/// * Returns 400 for unknown channels or track indices
pub async fn handle_set_binding(
    path: web::Path<String>,
    body: web::Json<TrackBinding>,
) -> HttpResponse {
    let id = match path.into_inner().parse::<ChannelId>() {
        Ok(id) => id,
        Err(e) => return HttpResponse::BadRequest().json(ErrorResponse::new(e)),
    };
    let binding = body.into_inner();

    let result = player::with_player(|player| {
        player
            .bind_channel(id, binding)
            .map(|()| player.status().channels)
    });
    match result {
        Ok(Ok(channels)) => {
            info!("{} binding set to {:?}", id, binding);
            HttpResponse::Ok().json(channels)
        }
        Ok(Err(e)) => {
            warn!("Rejected binding for {}: {}", id, e);
            HttpResponse::BadRequest().json(ErrorResponse::new(e))
        }
        Err(e) => {
            error!("Failed to bind {}: {}", id, e);
            HttpResponse::InternalServerError().json(ErrorResponse::new(e))
        }
    }
}

/// Moves one channel to a position while playback is stopped
///
/// # Returns
/// * `HttpResponse` - The frame that was written, if any
/// * Returns 409 while playing or without an open device
pub async fn handle_preview(
    path: web::Path<String>,
    body: web::Json<PreviewRequest>,
) -> HttpResponse {
    let id = match path.into_inner().parse::<ChannelId>() {
        Ok(id) => id,
        Err(e) => return HttpResponse::BadRequest().json(ErrorResponse::new(e)),
    };
    let position = body.position;

    // The serial write can block
    let result = web::block(move || player::with_player(|player| player.preview(id, position))).await;

    match result {
        Ok(Ok(Ok(frame))) => HttpResponse::Ok().json(PreviewResponse { channel: id, frame }),
        Ok(Ok(Err(e))) => HttpResponse::Conflict().json(ErrorResponse::new(e)),
        Ok(Err(e)) => {
            error!("Failed to preview {}: {}", id, e);
            HttpResponse::InternalServerError().json(ErrorResponse::new(e))
        }
        Err(e) => HttpResponse::InternalServerError().json(ErrorResponse::new(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{body::to_bytes, http::StatusCode};

    fn preview_body(position: f32) -> web::Json<PreviewRequest> {
        web::Json(PreviewRequest { position })
    }

    #[actix_web::test]
    async fn preview_rejects_unknown_channels() {
        let response = handle_preview(web::Path::from("X9".to_string()), preview_body(50.0)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn preview_runs_on_the_blocking_pool() {
        // No player is installed in unit tests, so the blocking call reports it
        let response = handle_preview(web::Path::from("L0".to_string()), preview_body(50.0)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body()).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("Player not initialized"));
    }
}
