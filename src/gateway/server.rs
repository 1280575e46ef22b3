// WebSocket listener and per-connection frame loop

use crate::gateway::address;
use crate::gateway::attachments::AttachmentPipeline;
use crate::gateway::auth::ConnectionAuthenticator;
use crate::gateway::config::GatewayConfig;
use crate::gateway::credentials::{CredentialValidator, SignedTokenValidator};
use crate::gateway::error::GatewayError;
use crate::gateway::fanout::SubscriptionHub;
use crate::gateway::frame::{Command, Frame, FrameError};
use crate::gateway::model::{ConnectionId, CorrelationToken, Identity, UserId};
use crate::gateway::presence::PresenceBroadcaster;
use crate::gateway::router::MessageRouter;
use crate::gateway::session::SessionRegistry;
use crate::gateway::storage::SqliteStore;
use crate::gateway::wire::{AttachmentRequest, DirectRequest, GroupRequest};
use anyhow::{Context, Result};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Everything a connection task needs
struct Shared {
    authenticator: ConnectionAuthenticator,
    hub: Arc<SubscriptionHub>,
    sessions: Arc<SessionRegistry>,
    presence: PresenceBroadcaster,
    router: MessageRouter,
    connect_timeout: Duration,
    ws_config: WebSocketConfig,
}

/// The message gateway
#[derive(Clone)]
pub struct Gateway {
    shared: Arc<Shared>,
}

impl Gateway {
    /// Build the gateway with its default collaborators
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let store = Arc::new(
            SqliteStore::new(&config.storage.data_dir).context("Failed to open message store")?,
        );
        let validator = Arc::new(
            SignedTokenValidator::new(&config.auth.token_secret).context("Invalid auth.token_secret")?,
        );
        Self::new(config, store, validator)
    }

    pub fn new(
        config: &GatewayConfig,
        store: Arc<SqliteStore>,
        validator: Arc<dyn CredentialValidator>,
    ) -> Result<Self> {
        let hub = Arc::new(SubscriptionHub::new());
        let sessions = Arc::new(SessionRegistry::new(store.clone()));
        let attachments = Arc::new(
            AttachmentPipeline::new(config.storage.upload_dir(), store.clone())
                .context("Failed to prepare upload directory")?,
        );

        let ws_config = WebSocketConfig {
            max_message_size: Some(config.server.max_frame_bytes),
            max_frame_size: Some(config.server.max_frame_bytes),
            ..Default::default()
        };

        let shared = Shared {
            authenticator: ConnectionAuthenticator::new(validator, config.auth.policy()),
            presence: PresenceBroadcaster::new(sessions.clone(), hub.clone()),
            router: MessageRouter::new(store.clone(), store, attachments, hub.clone()),
            hub,
            sessions,
            connect_timeout: config.auth.connect_timeout(),
            ws_config,
        };

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn sessions(&self) -> Arc<SessionRegistry> {
        self.shared.sessions.clone()
    }

    pub fn hub(&self) -> Arc<SubscriptionHub> {
        self.shared.hub.clone()
    }

    /// Accept connections until `shutdown` resolves
    pub async fn run(self, listener: TcpListener, shutdown: impl Future<Output = ()>) -> Result<()> {
        let local = listener.local_addr().context("Listener has no local address")?;
        tracing::info!("Gateway listening on ws://{}", local);

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let shared = self.shared.clone();
                            tokio::spawn(async move {
                                handle_connection(shared, stream, peer).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("Gateway shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Bind the listen address
pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))
}

fn unauthorized(reason: &GatewayError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    let mut handshake: Option<Identity> = None;

    let upgraded = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match shared.authenticator.authorize_handshake(request.uri().query()) {
                Ok(identity) => {
                    handshake = identity;
                    Ok(response)
                }
                Err(e) => Err(unauthorized(&e)),
            }
        },
        Some(shared.ws_config.clone()),
    )
    .await;

    let ws = match upgraded {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!("Handshake from {} refused: {}", peer, e);
            return;
        }
    };

    let connection = ConnectionId::new();
    tracing::info!(connection_id = %connection, "Connection upgraded from {}", peer);

    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    let writer_connection = connection.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let terminal = frame.command == Command::Error;
            if let Err(e) = sink.send(Message::Text(frame.to_text())).await {
                tracing::debug!(connection_id = %writer_connection, "Write failed: {}", e);
                break;
            }
            if terminal {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // The CONNECT frame must come first and in time
    let first = match tokio::time::timeout(shared.connect_timeout, next_frame(&mut source)).await {
        Ok(Some(Ok(frame))) => frame,
        Ok(Some(Err(e))) => {
            let _ = tx.send(Frame::error("malformed frame", &e.to_string()));
            return finish(tx, writer).await;
        }
        Ok(None) => return finish(tx, writer).await,
        Err(_) => {
            tracing::warn!(connection_id = %connection, "No CONNECT frame before deadline");
            let _ = tx.send(Frame::error("connect timeout", "no CONNECT frame received"));
            return finish(tx, writer).await;
        }
    };

    let identity = match shared.authenticator.authorize_connect(&first, handshake.as_ref()) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::warn!(connection_id = %connection, "Connect refused: {}", e);
            let _ = tx.send(Frame::error("authentication failed", &e.to_string()));
            return finish(tx, writer).await;
        }
    };

    shared.hub.attach(&connection, tx.clone());
    let _ = tx.send(Frame::connected(&identity.username));
    shared.presence.on_connected(&connection, &identity);

    while let Some(next) = next_frame(&mut source).await {
        let frame = match next {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(connection_id = %connection, "Malformed frame: {}", e);
                let _ = tx.send(Frame::error("malformed frame", &e.to_string()));
                break;
            }
        };

        if !on_frame(&shared, &connection, &identity, &tx, frame) {
            break;
        }
    }

    shared.hub.detach(&connection);
    shared.presence.on_disconnected(&connection);
    tracing::info!(connection_id = %connection, user_id = %identity.id, "Connection closed");

    finish(tx, writer).await;
}

/// Handle one frame after CONNECT; false ends the connection
fn on_frame(
    shared: &Shared,
    connection: &ConnectionId,
    identity: &Identity,
    tx: &mpsc::UnboundedSender<Frame>,
    frame: Frame,
) -> bool {
    match frame.command {
        Command::Send => {
            let destination = frame.get("destination").unwrap_or_default().to_string();
            let outcome = dispatch(shared, connection, identity, &destination, &frame.body);

            if outcome.is_ok() {
                if let Some(receipt) = frame.get("receipt") {
                    let _ = tx.send(Frame::receipt(receipt));
                }
            }
            true
        }
        Command::Subscribe => {
            let Some(destination) = frame.get("destination") else {
                let _ = tx.send(Frame::error("invalid subscription", "destination header is required"));
                return false;
            };
            let id = frame.get("id").unwrap_or(destination);

            if let Err(forbidden) = shared.hub.subscribe(connection, id, destination, identity) {
                tracing::warn!(
                    connection_id = %connection,
                    user_id = %identity.id,
                    destination,
                    "Subscription refused"
                );
                let _ = tx.send(Frame::error("subscription refused", &forbidden.0));
                return false;
            }

            if let Some(receipt) = frame.get("receipt") {
                let _ = tx.send(Frame::receipt(receipt));
            }
            true
        }
        Command::Unsubscribe => {
            if let Some(id) = frame.get("id") {
                shared.hub.unsubscribe(connection, id);
            }
            if let Some(receipt) = frame.get("receipt") {
                let _ = tx.send(Frame::receipt(receipt));
            }
            true
        }
        Command::Disconnect => {
            if let Some(receipt) = frame.get("receipt") {
                let _ = tx.send(Frame::receipt(receipt));
            }
            false
        }
        Command::Connect | Command::Stomp => {
            let _ = tx.send(Frame::error("already connected", "CONNECT may only be sent once"));
            false
        }
        other => {
            tracing::warn!(
                connection_id = %connection,
                "Ignoring client frame {}",
                other.as_str()
            );
            true
        }
    }
}

/// Route a SEND body by destination. Failures are logged and reported to the caller.
fn dispatch(
    shared: &Shared,
    connection: &ConnectionId,
    identity: &Identity,
    destination: &str,
    body: &str,
) -> Result<(), GatewayError> {
    let (token, result) = match destination {
        address::SEND_DIRECT => match decode::<DirectRequest>(body) {
            Ok(request) => {
                let token = request.correlation_token.clone();
                let result = ensure_sender(identity, request.sender_id)
                    .and_then(|_| shared.router.handle_direct(request));
                (token, result.map(drop))
            }
            Err(e) => (CorrelationToken::default(), Err(e)),
        },
        address::SEND_GROUP => match decode::<GroupRequest>(body) {
            Ok(request) => {
                let token = request.correlation_token.clone();
                let result = ensure_sender(identity, request.sender_id)
                    .and_then(|_| shared.router.handle_group(request));
                (token, result.map(drop))
            }
            Err(e) => (CorrelationToken::default(), Err(e)),
        },
        address::SEND_IMAGE => match decode::<AttachmentRequest>(body) {
            Ok(request) => {
                let token = request.correlation_token.clone();
                let result = ensure_sender(identity, request.sender_id)
                    .and_then(|_| shared.router.route_attachment(request));
                (token, result.map(drop))
            }
            Err(e) => (CorrelationToken::default(), Err(e)),
        },
        other => {
            tracing::warn!(
                connection_id = %connection,
                destination = other,
                "SEND to unknown destination ignored"
            );
            return Ok(());
        }
    };

    if let Err(e) = &result {
        match e {
            GatewayError::Persistence(_) => tracing::error!(
                connection_id = %connection,
                user_id = %identity.id,
                correlation_token = %token,
                destination,
                kind = e.kind(),
                "Send failed: {}",
                e
            ),
            _ => tracing::warn!(
                connection_id = %connection,
                user_id = %identity.id,
                correlation_token = %token,
                destination,
                kind = e.kind(),
                "Send rejected: {}",
                e
            ),
        }
    }

    result
}

/// A payload may only speak for the authenticated principal
fn ensure_sender(identity: &Identity, sender: Option<UserId>) -> Result<(), GatewayError> {
    match sender {
        Some(id) if id != identity.id => Err(GatewayError::validation(format!(
            "senderId {} does not match the connected user {}",
            id, identity.id
        ))),
        _ => Ok(()),
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, GatewayError> {
    serde_json::from_str(body).map_err(|e| GatewayError::validation(format!("malformed payload: {}", e)))
}

/// Next STOMP frame; `None` once the socket is closed
async fn next_frame(
    source: &mut SplitStream<WebSocketStream<TcpStream>>,
) -> Option<Result<Frame, FrameError>> {
    while let Some(message) = source.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => return Some(Err(FrameError::InvalidUtf8)),
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("WebSocket read error: {}", e);
                return None;
            }
        };

        match Frame::parse(&text) {
            Ok(Some(frame)) => return Some(Ok(frame)),
            Ok(None) => continue,
            Err(e) => return Some(Err(e)),
        }
    }
    None
}

/// Let the writer flush what is queued, then close
async fn finish(tx: mpsc::UnboundedSender<Frame>, writer: tokio::task::JoinHandle<()>) {
    drop(tx);
    let _ = writer.await;
}
