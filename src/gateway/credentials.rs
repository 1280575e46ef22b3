// Signed credentials presented by clients
//
// Token layout: base64url(claims JSON) "." hex(HMAC-SHA256(secret, first part))

use crate::gateway::model::Identity;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Why a credential was not accepted
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("malformed credential")]
    Malformed,

    #[error("signature mismatch")]
    BadSignature,

    #[error("credential expired")]
    Expired,

    #[error("signing secret rejected")]
    InvalidSecret,
}

/// External credential-validation collaborator
pub trait CredentialValidator: Send + Sync {
    /// Validate signature and expiry, resolving the credential to an identity
    fn validate(&self, token: &str) -> Result<Identity, CredentialError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    uid: i64,
    exp: i64,
}

/// HMAC-signed credentials sharing a secret with the issuer
pub struct SignedTokenValidator {
    keyed: HmacSha256,
}

impl SignedTokenValidator {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, CredentialError> {
        let keyed = HmacSha256::new_from_slice(secret.as_ref())
            .map_err(|_| CredentialError::InvalidSecret)?;
        Ok(Self { keyed })
    }

    fn mac(&self) -> HmacSha256 {
        self.keyed.clone()
    }

    /// Issue a credential for `identity` valid for `ttl_secs`
    pub fn issue(&self, identity: &Identity, ttl_secs: i64) -> String {
        let claims = Claims {
            sub: identity.username.clone(),
            uid: identity.id.0,
            exp: Utc::now().timestamp().saturating_add(ttl_secs),
        };

        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap_or_default());

        let mut mac = self.mac();
        mac.update(body.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        format!("{}.{}", body, signature)
    }
}

impl CredentialValidator for SignedTokenValidator {
    fn validate(&self, token: &str) -> Result<Identity, CredentialError> {
        let (body, signature) = token.split_once('.').ok_or(CredentialError::Malformed)?;
        let signature = hex::decode(signature).map_err(|_| CredentialError::Malformed)?;

        let mut mac = self.mac();
        mac.update(body.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| CredentialError::BadSignature)?;

        let raw = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| CredentialError::Malformed)?;
        let claims: Claims = serde_json::from_slice(&raw).map_err(|_| CredentialError::Malformed)?;

        if claims.exp <= Utc::now().timestamp() {
            return Err(CredentialError::Expired);
        }

        Ok(Identity::new(claims.uid, claims.sub))
    }
}
