// Connection authentication at handshake and at the connect frame

use crate::gateway::credentials::CredentialValidator;
use crate::gateway::error::GatewayError;
use crate::gateway::frame::{Command, Frame};
use crate::gateway::model::Identity;
use std::sync::Arc;

/// Which validation points are mandatory
#[derive(Debug, Clone, Copy)]
pub struct AuthPolicy {
    pub require_handshake_token: bool,
    pub require_connect_header: bool,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            require_handshake_token: true,
            require_connect_header: true,
        }
    }
}

/// Validates credentials through the external validator.
///
/// Refusals are returned, never thrown; the connection owner closes the socket.
#[derive(Clone)]
pub struct ConnectionAuthenticator {
    validator: Arc<dyn CredentialValidator>,
    policy: AuthPolicy,
}

impl ConnectionAuthenticator {
    pub fn new(validator: Arc<dyn CredentialValidator>, policy: AuthPolicy) -> Self {
        Self { validator, policy }
    }

    /// Check the `token` query parameter of the upgrade request.
    ///
    /// `Ok(None)` only when no token was sent and the handshake token is optional.
    pub fn authorize_handshake(&self, query: Option<&str>) -> Result<Option<Identity>, GatewayError> {
        let token = query.and_then(|q| query_param(q, "token"));

        let token = match token {
            Some(token) if !token.is_empty() => token,
            _ if self.policy.require_handshake_token => {
                tracing::warn!("No token in handshake request, rejecting");
                return Err(GatewayError::authentication("missing handshake token"));
            }
            _ => return Ok(None),
        };

        let identity = self.validate(&token, "handshake")?;
        tracing::info!(user_id = %identity.id, "Handshake authenticated for {}", identity.username);
        Ok(Some(identity))
    }

    /// Check the first frame and bind the connection principal
    pub fn authorize_connect(
        &self,
        frame: &Frame,
        handshake: Option<&Identity>,
    ) -> Result<Identity, GatewayError> {
        if !matches!(frame.command, Command::Connect | Command::Stomp) {
            return Err(GatewayError::authentication(format!(
                "expected CONNECT, got {}",
                frame.command.as_str()
            )));
        }

        let header = frame.get_ignore_case("Authorization").map(str::trim);

        let identity = match header {
            Some(value) => {
                let token = bearer_token(value)
                    .ok_or_else(|| GatewayError::authentication("Authorization header is not a bearer credential"))?;
                self.validate(token, "connect")?
            }
            None if self.policy.require_connect_header => {
                tracing::warn!("Missing Authorization header on CONNECT, rejecting");
                return Err(GatewayError::authentication("missing Authorization header"));
            }
            None => handshake
                .cloned()
                .ok_or_else(|| GatewayError::authentication("no credential presented"))?,
        };

        // Both stages must agree on who is connecting
        if let Some(earlier) = handshake {
            if earlier.id != identity.id {
                tracing::warn!(
                    user_id = %identity.id,
                    "Connect credential does not match handshake identity {}",
                    earlier.id
                );
                return Err(GatewayError::authentication("credential mismatch between handshake and connect"));
            }
        }

        Ok(identity)
    }

    fn validate(&self, token: &str, stage: &str) -> Result<Identity, GatewayError> {
        self.validator.validate(token).map_err(|e| {
            tracing::warn!(stage, "Credential rejected: {}", e);
            GatewayError::authentication(e.to_string())
        })
    }
}

fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// First value of `name` in a URL query string, percent-decoded
fn query_param(query: &str, name: &str) -> Option<String> {
    query
        .trim_start_matches('?')
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(key, _)| *key == name)
        .and_then(|(_, value)| {
            let value = value.replace('+', " ");
            urlencoding::decode(&value).ok().map(|v| v.into_owned())
        })
}
