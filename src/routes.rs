// src/routes.rs

//! Route configuration for the T-Code player web server.
//! Defines all HTTP endpoints and the WebSocket connection.

use actix_web::web;
use crate::{
    handlers::{
        channels,
        config,
        device,
        funscript
    },
    tcode_socket
};

/// Configures all routes for the web server.
///
/// # Routes
/// - `/ws` - WebSocket endpoint for clock updates and playback control
/// - `/site` - Player API:
///   - `/funscripts/{filename}` - Load the funscripts of a video
///   - `/config` - Read (GET) or replace (PUT) the player configuration
///   - `/channels` - Channel bindings and last emitted values
///   - `/channels/{id}/binding` - Bind a channel by hand
///   - `/channels/{id}/preview` - Move one channel while stopped
///   - `/device` - Player status
///   - `/device/open`, `/device/close` - Serial port lifecycle
///
/// # Arguments
/// * `cfg` - Service configuration to add routes to
pub fn setup_routes(cfg: &mut web::ServiceConfig) {
    cfg
        .service(
            web::resource("/ws")
                .route(web::get().to(tcode_socket::handle_ws_start))
        )
        .service(
            web::scope("/site")
                .route("/funscripts/{filename:.*}", web::get().to(funscript::handle_funscript))
                .route("/config", web::get().to(config::handle_get_config))
                .route("/config", web::put().to(config::handle_put_config))
                .route("/channels", web::get().to(channels::handle_channels))
                .route("/channels/{id}/binding", web::put().to(channels::handle_set_binding))
                .route("/channels/{id}/preview", web::post().to(channels::handle_preview))
                .route("/device", web::get().to(device::handle_device_status))
                .route("/device/open", web::post().to(device::handle_open_device))
                .route("/device/close", web::post().to(device::handle_close_device))
        );
}
