// src/tcode_socket.rs

//! WebSocket control surface for the browser video player
//!
//! The page sends JSON text messages tagged by `type`:
//!
//! - `{"type":"clock","time_ms":1234.5,"speed":1.0}` - current video time, sent often
//! - `{"type":"play","time_ms":0}` / `{"type":"stop"}`
//! - `{"type":"sync","time_ms":60000}` - after a seek
//! - `{"type":"preview","channel":"L0","position":50}`
//!
//! Clock updates go straight to the clock handoff. Everything else may block
//! briefly, so each connection hands it to its own worker thread, which
//! applies messages one at a time in the order they arrived.

use log::{info, warn, error, debug};
use actix::{Actor, ActorContext, StreamHandler};
use crossbeam_channel::{unbounded, Sender};
use std::thread::{self, JoinHandle};
use actix_web_actors::ws;
use actix_web::{web, HttpRequest, HttpResponse, Error};
use serde::{Deserialize, Serialize};
use crate::tcode::{channel::ChannelId, player::{self, TCodePlayer}};

fn default_speed() -> f64 {
    1.0
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SocketMessage {
    Clock {
        time_ms: f64,
        #[serde(default = "default_speed")]
        speed: f64,
    },
    Play {
        #[serde(default)]
        time_ms: f64,
    },
    Stop,
    Sync {
        time_ms: f64,
    },
    Preview {
        channel: ChannelId,
        position: f32,
    },
}

#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "lowercase")]
enum SocketReply {
    Error { message: String },
}

/// Parses one text message from the page
pub fn parse_message(text: &str) -> Result<SocketMessage, String> {
    serde_json::from_str(text).map_err(|e| format!("Invalid message '{}': {}", text, e))
}

/// Applies one message to the player.
pub fn apply_message(player: &mut TCodePlayer, message: SocketMessage) -> Result<(), String> {
    match message {
        SocketMessage::Clock { time_ms, speed } => {
            player.publish_clock(time_ms, speed);
            Ok(())
        }
        SocketMessage::Play { time_ms } => player.play(time_ms),
        SocketMessage::Stop => player.stop(),
        SocketMessage::Sync { time_ms } => {
            player.sync(time_ms);
            Ok(())
        }
        SocketMessage::Preview { channel, position } => {
            player.preview(channel, position).map(|_| ())
        }
    }
}

/// Ordered queue drained by one worker thread.
pub struct Dispatcher {
    sender: Option<Sender<SocketMessage>>,
    worker: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawns the worker; `apply` sees messages in the order they were sent.
    pub fn spawn<F>(mut apply: F) -> Result<Self, String>
    where
        F: FnMut(SocketMessage) + Send + 'static,
    {
        let (sender, receiver) = unbounded::<SocketMessage>();
        let worker = thread::Builder::new()
            .name("tcode-socket".into())
            .spawn(move || {
                for message in receiver {
                    apply(message);
                }
            })
            .map_err(|e| format!("Failed to spawn socket worker: {}", e))?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn send(&self, message: SocketMessage) {
        let delivered = self
            .sender
            .as_ref()
            .map_or(false, |sender| sender.send(message).is_ok());
        if !delivered {
            warn!("Socket worker is gone, dropping message");
        }
    }

    /// Closes the queue and waits until every queued message is applied.
    pub fn finish(mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Socket worker panicked");
            }
        }
    }
}

fn apply_to_player(message: SocketMessage) {
    let label = format!("{:?}", message);
    match player::with_player(|player| apply_message(player, message)) {
        Ok(Ok(())) => debug!("Handled {}", label),
        Ok(Err(e)) => warn!("{} failed: {}", label, e),
        Err(e) => error!("{} failed: {}", label, e),
    }
}

#[derive(Default)]
pub struct TCodeSocket {
    dispatcher: Option<Dispatcher>,
}

impl Actor for TCodeSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        match Dispatcher::spawn(apply_to_player) {
            Ok(dispatcher) => self.dispatcher = Some(dispatcher),
            Err(e) => {
                error!("{}", e);
                ctx.stop();
            }
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for TCodeSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match parse_message(&text) {
                Ok(SocketMessage::Clock { time_ms, speed }) => player::publish_clock(time_ms, speed),
                Ok(message) => {
                    if let Some(dispatcher) = &self.dispatcher {
                        dispatcher.send(message);
                    }
                }
                Err(e) => {
                    warn!("{}", e);
                    if let Ok(reply) = serde_json::to_string(&SocketReply::Error { message: e }) {
                        ctx.text(reply);
                    }
                }
            },
            Ok(ws::Message::Ping(msg)) => ctx.pong(&msg),
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                warn!("WebSocket protocol error: {}", e);
                ctx.stop();
            }
            _ => {}
        }
    }
}

pub async fn handle_ws_start(req: HttpRequest, stream: web::Payload) -> Result<HttpResponse, Error> {
    info!("WebSocket connection attempt");
    match ws::start(TCodeSocket::default(), &req, stream) {
        Ok(response) => {
            info!("WebSocket connection established");
            Ok(response)
        }
        Err(e) => {
            error!("WebSocket error: {}", e);
            Err(e)
        }
    }
}
