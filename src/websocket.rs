//! # Client WebSocket Handler
//!
//! One actix actor per connected client. The actor owns the socket; the
//! relay only ever reaches it through a [`ConnectionSink`] wrapping the
//! actor's mailbox.
//!
//! ## Frame flow:
//! - **Inbound**: text frames are queued in arrival order and handed to
//!   [`Relay::handle_frame`] by one task per connection, so audio chunks
//!   reach the bridge in the order the client sent them
//! - **Outbound**: any component calls `deliver`, which `try_send`s a
//!   [`Deliver`] message; the actor writes it to the socket
//!
//! ## Liveness:
//! The actor pings every 30 seconds and stops when nothing has been heard
//! from the client for 60 seconds. Stopping deregisters the connection,
//! which cancels its session and removes it from its game.

use crate::connection::{ConnectionId, ConnectionSink, DeliveryError};
use crate::error::AppError;
use crate::protocol::ServerMessage;
use crate::relay::Relay;
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Inbound frames waiting for the relay, per connection
const INBOUND_QUEUE_CAPACITY: usize = 256;

/// Text frame to write to the client.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Deliver(pub String);

/// [`ConnectionSink`] backed by a client actor's mailbox.
pub struct ActorSink(Recipient<Deliver>);

impl ConnectionSink for ActorSink {
    fn deliver(&self, frame: &str) -> Result<(), DeliveryError> {
        self.0.try_send(Deliver(frame.to_string())).map_err(|e| match e {
            SendError::Full(_) => DeliveryError::Backpressure,
            SendError::Closed(_) => DeliveryError::PeerUnreachable,
        })
    }
}

/// WebSocket actor for one client connection.
pub struct ClientSocket {
    relay: Arc<Relay>,

    /// Assigned by the registry once the actor is running
    connection_id: Option<ConnectionId>,

    /// Ordered hand-off to the frame task
    inbound: Option<mpsc::Sender<String>>,

    last_heartbeat: Instant,
}

impl ClientSocket {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self {
            relay,
            connection_id: None,
            inbound: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(
                    "Heartbeat timeout for {}, closing connection",
                    act.connection_label()
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn connection_label(&self) -> String {
        self.connection_id
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "unregistered client".to_string())
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, err: &AppError) {
        match serde_json::to_string(&ServerMessage::error(err)) {
            Ok(json) => ctx.text(json),
            Err(e) => error!("Could not encode error frame: {}", e),
        }
    }

    fn enqueue(&self, text: String, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(inbound) = &self.inbound else {
            return;
        };
        match inbound.try_send(text) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Inbound backlog for {}, frame dropped", self.connection_label());
                self.send_error(
                    ctx,
                    &AppError::Validation("inbound backlog, frame dropped".to_string()),
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => ctx.stop(),
        }
    }
}

impl Actor for ClientSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.heartbeat(ctx);

        let sink = Arc::new(ActorSink(ctx.address().recipient()));
        let id = self.relay.register(sink);

        let (tx, mut rx) = mpsc::channel::<String>(INBOUND_QUEUE_CAPACITY);
        let relay = self.relay.clone();
        let conn = id.clone();
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                relay.handle_frame(&conn, &text).await;
            }
            debug!("Frame task for {} finished", conn);
        });

        self.inbound = Some(tx);
        self.connection_id = Some(id);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Dropping the sender ends the frame task
        self.inbound = None;
        if let Some(id) = self.connection_id.take() {
            let relay = self.relay.clone();
            tokio::spawn(async move {
                relay.deregister(&id).await;
            });
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ClientSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.enqueue(text.to_string(), ctx);
            }
            Ok(ws::Message::Binary(_)) => {
                self.last_heartbeat = Instant::now();
                self.send_error(
                    ctx,
                    &AppError::Validation(
                        "binary frames are not accepted; send audioData as base64".to_string(),
                    ),
                );
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("{} closed the socket: {:?}", self.connection_label(), reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Unexpected continuation frame from {}", self.connection_label());
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error from {}: {}", self.connection_label(), err);
                ctx.stop();
            }
        }
    }
}

impl Handler<Deliver> for ClientSocket {
    type Result = ();

    fn handle(&mut self, msg: Deliver, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// `GET /ws`: upgrade to a relay connection.
pub async fn client_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!(
        "WebSocket upgrade request from {:?}",
        req.connection_info().peer_addr()
    );
    ws::start(ClientSocket::new(app_state.relay()), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collector(Vec<String>);

    impl Actor for Collector {
        type Context = Context<Self>;
    }

    impl Handler<Deliver> for Collector {
        type Result = ();

        fn handle(&mut self, msg: Deliver, _ctx: &mut Self::Context) {
            self.0.push(msg.0);
        }
    }

    #[derive(Message)]
    #[rtype(result = "Vec<String>")]
    struct Collected;

    impl Handler<Collected> for Collector {
        type Result = MessageResult<Collected>;

        fn handle(&mut self, _msg: Collected, _ctx: &mut Self::Context) -> Self::Result {
            MessageResult(self.0.clone())
        }
    }

    #[actix::test]
    async fn test_actor_sink_delivers_in_order() {
        let addr = Collector::default().start();
        let sink = ActorSink(addr.clone().recipient());
        assert_eq!(sink.deliver(r#"{"type":"welcome"}"#), Ok(()));
        assert_eq!(sink.deliver(r#"{"type":"sessionStarted"}"#), Ok(()));

        let frames = addr.send(Collected).await.unwrap();
        assert_eq!(
            frames,
            vec![r#"{"type":"welcome"}"#, r#"{"type":"sessionStarted"}"#]
        );
    }
}
