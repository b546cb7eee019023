use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Duration;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::clock::Clock;
use crate::selection::RespondAction;

type HmacSha256 = Hmac<Sha256>;

/// Minimum byte length for the signing secret.
pub const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum TokenConfigError {
    #[error("match token secret is not configured")]
    SecretMissing,
    #[error("match token secret must be at least {MIN_SECRET_LEN} bytes, got {length}")]
    SecretTooShort { length: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum TokenMintError {
    #[error("failed to encode token payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to initialize token signer")]
    Signer,
}

/// Verification failures surfaced to callers.
///
/// `Invalid` deliberately carries no detail: malformed segments, a bad
/// signature, and unknown or mistyped payload fields all collapse into it so
/// responses cannot be used as an oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenVerifyError {
    #[error("token is invalid")]
    Invalid,
    #[error("token has expired")]
    Expired,
}

/// Payload of an accept/decline token, reconstructed purely from the token
/// itself. `exp` is epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RespondClaims {
    pub request_id: String,
    pub student_id: String,
    pub selection_id: String,
    pub action: RespondAction,
    pub exp: i64,
}

/// Payload of a read-only "view my request" token. Omits the selection and
/// action on purpose; it authorizes nothing but reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ViewClaims {
    pub request_id: String,
    pub student_id: String,
    pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct RespondGrant {
    pub request_id: String,
    pub student_id: String,
    pub selection_id: String,
    pub action: RespondAction,
}

#[derive(Debug, Clone)]
pub struct ViewGrant {
    pub request_id: String,
    pub student_id: String,
}

/// Mints and verifies `base64url(payload).base64url(hmac-sha256)` action
/// tokens. Stateless: verification proves the payload was minted here and has
/// not expired, nothing about whether the referenced selection is still
/// actionable.
#[derive(Clone)]
pub struct MatchTokenCodec {
    secret: String,
    clock: Arc<dyn Clock>,
}

/// Rejects a missing or short signing secret. Exposed so configuration
/// loading can fail the process at startup with the same rules the codec
/// enforces.
pub fn validate_secret(secret: &str) -> Result<(), TokenConfigError> {
    let secret = secret.trim();
    if secret.is_empty() {
        return Err(TokenConfigError::SecretMissing);
    }
    if secret.len() < MIN_SECRET_LEN {
        return Err(TokenConfigError::SecretTooShort {
            length: secret.len(),
        });
    }
    Ok(())
}

impl MatchTokenCodec {
    /// Builds a codec, refusing a missing or short secret outright so the
    /// process fails at startup rather than minting weak tokens.
    pub fn new(secret: &str, clock: Arc<dyn Clock>) -> Result<Self, TokenConfigError> {
        validate_secret(secret)?;
        Ok(Self {
            secret: secret.trim().to_string(),
            clock,
        })
    }

    pub fn mint_respond(
        &self,
        grant: &RespondGrant,
        ttl_hours: u32,
    ) -> Result<String, TokenMintError> {
        let claims = RespondClaims {
            request_id: grant.request_id.clone(),
            student_id: grant.student_id.clone(),
            selection_id: grant.selection_id.clone(),
            action: grant.action,
            exp: self.expiry_ms(ttl_hours),
        };
        self.sign_payload(&serde_json::to_vec(&claims)?)
    }

    pub fn mint_view(&self, grant: &ViewGrant, ttl_hours: u32) -> Result<String, TokenMintError> {
        let claims = ViewClaims {
            request_id: grant.request_id.clone(),
            student_id: grant.student_id.clone(),
            exp: self.expiry_ms(ttl_hours),
        };
        self.sign_payload(&serde_json::to_vec(&claims)?)
    }

    pub fn verify_respond(&self, token: &str) -> Result<RespondClaims, TokenVerifyError> {
        let payload = self.verified_payload(token)?;
        let claims: RespondClaims =
            serde_json::from_slice(&payload).map_err(|_| TokenVerifyError::Invalid)?;
        self.check_expiry(claims.exp)?;
        Ok(claims)
    }

    pub fn verify_view(&self, token: &str) -> Result<ViewClaims, TokenVerifyError> {
        let payload = self.verified_payload(token)?;
        let claims: ViewClaims =
            serde_json::from_slice(&payload).map_err(|_| TokenVerifyError::Invalid)?;
        self.check_expiry(claims.exp)?;
        Ok(claims)
    }

    fn expiry_ms(&self, ttl_hours: u32) -> i64 {
        (self.clock.now() + Duration::hours(i64::from(ttl_hours))).timestamp_millis()
    }

    fn check_expiry(&self, exp: i64) -> Result<(), TokenVerifyError> {
        if exp <= self.clock.now().timestamp_millis() {
            return Err(TokenVerifyError::Expired);
        }
        Ok(())
    }

    fn sign_payload(&self, payload: &[u8]) -> Result<String, TokenMintError> {
        let payload_segment = URL_SAFE_NO_PAD.encode(payload);
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| TokenMintError::Signer)?;
        mac.update(payload_segment.as_bytes());
        let signature_segment = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{payload_segment}.{signature_segment}"))
    }

    /// Checks the signature and returns the decoded payload bytes.
    ///
    /// The signature comparison runs over the two fixed-length digests via
    /// `Mac::verify_slice`, which is constant-time; the variable-length
    /// payload segment is never compared directly.
    fn verified_payload(&self, token: &str) -> Result<Vec<u8>, TokenVerifyError> {
        let mut segments = token.split('.');
        let (payload_segment, signature_segment) =
            match (segments.next(), segments.next(), segments.next()) {
                (Some(payload), Some(signature), None)
                    if !payload.is_empty() && !signature.is_empty() =>
                {
                    (payload, signature)
                }
                _ => return Err(TokenVerifyError::Invalid),
            };

        let signature = URL_SAFE_NO_PAD
            .decode(signature_segment)
            .map_err(|_| TokenVerifyError::Invalid)?;

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| TokenVerifyError::Invalid)?;
        mac.update(payload_segment.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenVerifyError::Invalid)?;

        URL_SAFE_NO_PAD
            .decode(payload_segment)
            .map_err(|_| TokenVerifyError::Invalid)
    }
}
