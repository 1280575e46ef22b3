// Real-time message gateway
//
// Authenticates STOMP-over-WebSocket connections, tracks which identity owns
// each connection, routes direct and group messages and inline attachments,
// and reports each send's outcome back to the sender.

pub mod ack;
pub mod address;
pub mod attachments;
pub mod auth;
pub mod cli;
pub mod commands;
pub mod config;
pub mod credentials;
pub mod error;
pub mod fanout;
pub mod frame;
pub mod model;
pub mod presence;
pub mod router;
pub mod server;
pub mod session;
pub mod storage;
pub mod wire;

pub use ack::{AckScope, Acknowledger, Acknowledgment, Outcome, PendingAck};
pub use attachments::AttachmentPipeline;
pub use auth::{AuthPolicy, ConnectionAuthenticator};
pub use cli::{GatewayCli, GatewayCommand};
pub use commands::execute_command;
pub use config::GatewayConfig;
pub use credentials::{CredentialError, CredentialValidator, SignedTokenValidator};
pub use error::{GatewayError, StoreError};
pub use fanout::{Payload, Publisher, SubscriptionHub};
pub use frame::{Command, Frame, FrameError};
pub use model::{ConnectionId, CorrelationToken, GroupId, Identity, UserId};
pub use presence::PresenceBroadcaster;
pub use router::MessageRouter;
pub use server::Gateway;
pub use session::SessionRegistry;
pub use storage::{Directory, Repository, SqliteStore};
