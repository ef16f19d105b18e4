//! Resumable attempt tokens
//!
//! A suspended [`ChainExecutionState`] is parked as an opaque string:
//!
//! ```text
//! v1.<base64url(json state)>.<base64url(hmac-sha256)>
//! ```
//!
//! The signature segment is empty when no key is configured. The version
//! prefix lets the layout change without misreading older tokens.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::EngineError;
use crate::state::ChainExecutionState;

type HmacSha256 = Hmac<Sha256>;

/// Current token layout version
pub const TOKEN_VERSION: &str = "v1";

/// Encodes and decodes attempt state tokens
#[derive(Clone, Default)]
pub struct TokenCodec {
    key: Option<Vec<u8>>,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("signed", &self.key.is_some())
            .finish()
    }
}

impl TokenCodec {
    /// Codec without integrity protection
    #[must_use]
    pub fn unsigned() -> Self {
        Self { key: None }
    }

    /// Codec that signs tokens with an HMAC key
    pub fn signed(key: impl AsRef<[u8]>) -> Self {
        Self {
            key: Some(key.as_ref().to_vec()),
        }
    }

    #[must_use]
    pub fn from_key(key: Option<&str>) -> Self {
        key.filter(|k| !k.is_empty())
            .map_or_else(Self::unsigned, |k| Self::signed(k))
    }

    pub fn is_signed(&self) -> bool {
        self.key.is_some()
    }

    /// Encode a state into a token
    pub fn encode(&self, state: &ChainExecutionState) -> Result<String, EngineError> {
        let payload = serde_json::to_vec(state)
            .map_err(|e| EngineError::Internal(format!("encode attempt state: {e}")))?;
        let payload = URL_SAFE_NO_PAD.encode(payload);
        let signature = self
            .sign(&payload)
            .map(|sig| URL_SAFE_NO_PAD.encode(sig))
            .unwrap_or_default();
        Ok(format!("{TOKEN_VERSION}.{payload}.{signature}"))
    }

    /// Decode and verify a token
    pub fn decode(&self, token: &str) -> Result<ChainExecutionState, EngineError> {
        let mut parts = token.splitn(3, '.');
        let (Some(version), Some(payload), Some(signature)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(EngineError::InvalidToken("truncated token".into()));
        };

        if version != TOKEN_VERSION {
            return Err(EngineError::InvalidToken(format!(
                "unsupported token version {version}"
            )));
        }

        if let Some(key) = &self.key {
            let signature = URL_SAFE_NO_PAD
                .decode(signature)
                .map_err(|_| EngineError::InvalidToken("bad signature encoding".into()))?;
            let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
            mac.update(payload.as_bytes());
            mac.verify_slice(&signature)
                .map_err(|_| EngineError::InvalidToken("signature mismatch".into()))?;
        }

        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| EngineError::InvalidToken("bad payload encoding".into()))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::InvalidToken(format!("undecodable state: {e}")))
    }

    fn sign(&self, payload: &str) -> Option<Vec<u8>> {
        let key = self.key.as_ref()?;
        let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        Some(mac.finalize().into_bytes().to_vec())
    }
}
