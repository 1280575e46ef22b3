//! Test utilities and fixtures for hermes
//!
//! Starts a gateway on an ephemeral port backed by a temporary store, and
//! provides a small STOMP client over `tokio-tungstenite`.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use hermes::gateway::{Command, Frame, Gateway, GatewayConfig, Identity, SignedTokenValidator, SqliteStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const SECRET: &str = "integration-secret";

/// How long a client waits for the next frame
pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Create a temporary directory for testing
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

/// A gateway running on 127.0.0.1 with its own store
pub struct TestGateway {
    pub dir: TempDir,
    pub store: Arc<SqliteStore>,
    pub issuer: Arc<SignedTokenValidator>,
    pub gateway: Gateway,
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestGateway {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(adjust: impl FnOnce(&mut GatewayConfig)) -> Self {
        let dir = temp_dir();

        let mut config = GatewayConfig::default();
        config.server.listen_addr = "127.0.0.1:0".to_string();
        config.storage.data_dir = dir.path().to_path_buf();
        config.auth.token_secret = SECRET.to_string();
        adjust(&mut config);

        let store = Arc::new(SqliteStore::new(&config.storage.data_dir).unwrap());
        let issuer = Arc::new(SignedTokenValidator::new(SECRET).unwrap());
        let gateway = Gateway::new(&config, store.clone(), issuer.clone()).unwrap();

        let listener = hermes::gateway::server::bind(&config.server.listen_addr).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown, stopped) = oneshot::channel::<()>();
        let running = gateway.clone();
        tokio::spawn(async move {
            let _ = running
                .run(listener, async {
                    let _ = stopped.await;
                })
                .await;
        });

        Self {
            dir,
            store,
            issuer,
            gateway,
            addr,
            shutdown: Some(shutdown),
        }
    }

    pub fn user(&self, username: &str) -> Identity {
        self.store.create_user(username).unwrap()
    }

    pub fn token(&self, identity: &Identity) -> String {
        self.issuer.issue(identity, 3600)
    }

    pub fn url(&self, token: Option<&str>) -> String {
        match token {
            Some(token) => format!("ws://{}/ws?token={}", self.addr, token),
            None => format!("ws://{}/ws", self.addr),
        }
    }

    /// Open a connection and complete CONNECT for `identity`
    pub async fn connect(&self, identity: &Identity) -> StompClient {
        let token = self.token(identity);
        let mut client = StompClient::open(&self.url(Some(&token))).await.unwrap();

        client.send(connect_frame(Some(&token))).await;
        let reply = client.recv().await.expect("no reply to CONNECT");
        assert_eq!(reply.command, Command::Connected, "CONNECT refused: {:?}", reply);
        assert_eq!(reply.get("user-name"), Some(identity.username.as_str()));

        client
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

pub fn connect_frame(token: Option<&str>) -> Frame {
    let frame = Frame::new(Command::Connect)
        .header("accept-version", "1.2")
        .header("host", "localhost");
    match token {
        Some(token) => frame.header("Authorization", format!("Bearer {}", token)),
        None => frame,
    }
}

/// Minimal STOMP client
pub struct StompClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    receipts: u32,
}

impl StompClient {
    pub async fn open(url: &str) -> Result<Self, tungstenite::Error> {
        let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
        Ok(Self { ws, receipts: 0 })
    }

    pub async fn send(&mut self, frame: Frame) {
        let _ = self.ws.send(Message::Text(frame.to_text())).await;
    }

    /// Send a WebSocket message as is
    pub async fn send_raw(&mut self, message: Message) {
        let _ = self.ws.send(message).await;
    }

    /// Next frame, or `None` on close or timeout
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            let next = tokio::time::timeout(RECV_TIMEOUT, self.ws.next()).await.ok()??;
            match next.ok()? {
                Message::Text(text) => match Frame::parse(&text) {
                    Ok(Some(frame)) => return Some(frame),
                    Ok(None) => continue,
                    Err(e) => panic!("server sent a malformed frame: {}", e),
                },
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    /// Wait for a MESSAGE on `destination`, skipping anything else
    pub async fn recv_message(&mut self, destination: &str) -> Option<Frame> {
        loop {
            let frame = self.recv().await?;
            if frame.command == Command::Message && frame.get("destination") == Some(destination) {
                return Some(frame);
            }
        }
    }

    /// Like `recv_message`, decoding the JSON body
    pub async fn recv_json(&mut self, destination: &str) -> Option<serde_json::Value> {
        let frame = self.recv_message(destination).await?;
        Some(serde_json::from_str(&frame.body).expect("MESSAGE body is not JSON"))
    }

    /// Wait for the RECEIPT of `id`; false when anything ends the wait first
    pub async fn await_receipt(&mut self, id: &str) -> bool {
        while let Some(frame) = self.recv().await {
            match frame.command {
                Command::Receipt if frame.get("receipt-id") == Some(id) => return true,
                Command::Error => return false,
                _ => continue,
            }
        }
        false
    }

    fn next_receipt(&mut self) -> String {
        self.receipts += 1;
        format!("r-{}", self.receipts)
    }

    /// Subscribe and wait until the server has registered it
    pub async fn subscribe(&mut self, destination: &str) -> bool {
        let receipt = self.next_receipt();
        let frame = Frame::new(Command::Subscribe)
            .header("id", format!("sub-{}", self.receipts))
            .header("destination", destination)
            .header("receipt", receipt.as_str());
        self.send(frame).await;
        self.await_receipt(&receipt).await
    }

    /// SEND a JSON body without waiting
    pub async fn send_json(&mut self, destination: &str, body: serde_json::Value) {
        let frame = Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(body.to_string());
        self.send(frame).await;
    }

    /// SEND a JSON body and wait for its RECEIPT
    pub async fn send_json_receipted(&mut self, destination: &str, body: serde_json::Value) -> String {
        let receipt = self.next_receipt();
        let frame = Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .header("receipt", receipt.as_str())
            .with_body(body.to_string());
        self.send(frame).await;
        receipt
    }

    pub async fn disconnect(mut self) {
        let receipt = self.next_receipt();
        self.send(Frame::new(Command::Disconnect).header("receipt", receipt.as_str()))
            .await;
        let _ = self.await_receipt(&receipt).await;
        let _ = self.ws.close(None).await;
    }
}

/// Wait for a condition with timeout
pub async fn wait_for<F>(mut condition: F, timeout_secs: u64) -> bool
where
    F: FnMut() -> bool,
{
    use tokio::time::{sleep, Duration};

    let start = std::time::Instant::now();
    while start.elapsed().as_secs() < timeout_secs {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}
