//! Request signing for the Delta WebSocket auth handshake
//!
//! Signature: hex(HMAC-SHA256(secret, method + timestamp + path + body)),
//! timestamp in unix seconds.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;

use relay_core::{RelayError, RelayResult};

use crate::protocol::OutboundFrame;

type HmacSha256 = Hmac<Sha256>;

/// Method and path signed for the realtime feed
pub const WS_AUTH_METHOD: &str = "GET";
pub const WS_AUTH_PATH: &str = "/live";

/// API key pair for the exchange
#[derive(Clone, PartialEq, Eq)]
pub struct DeltaCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for DeltaCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaCredentials")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

impl DeltaCredentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Build the auth frame for `timestamp` (unix seconds)
    pub fn auth_frame_at(&self, timestamp: u64) -> RelayResult<OutboundFrame> {
        let timestamp = timestamp.to_string();
        let signature = sign_request(
            &self.api_secret,
            WS_AUTH_METHOD,
            &timestamp,
            WS_AUTH_PATH,
            "",
        )?;

        Ok(OutboundFrame::auth(&self.api_key, signature, timestamp))
    }

    /// Build the auth frame for the current time
    pub fn auth_frame(&self) -> RelayResult<OutboundFrame> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| RelayError::internal(format!("system clock before epoch: {}", e)))?
            .as_secs();
        self.auth_frame_at(timestamp)
    }
}

/// Sign `method + timestamp + path + body` with the API secret
pub fn sign_request(
    secret: &str,
    method: &str,
    timestamp: &str,
    path: &str,
    body: &str,
) -> RelayResult<String> {
    let message = format!("{}{}{}{}", method, timestamp, path, body);

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| RelayError::auth(format!("Failed to create HMAC: {}", e)))?;
    mac.update(message.as_bytes());

    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_request_known_vector() {
        let signature =
            sign_request("test-secret", "GET", "1700000000", "/live", "").unwrap();
        assert_eq!(
            signature,
            "18b3e4c6f67a3678e0e31a655eab20c9795208903e00cf68ab674869d8f39ed3"
        );
    }

    #[test]
    fn test_signature_depends_on_every_part() {
        let base = sign_request("s", "GET", "1", "/live", "").unwrap();
        assert_ne!(base, sign_request("s", "POST", "1", "/live", "").unwrap());
        assert_ne!(base, sign_request("s", "GET", "2", "/live", "").unwrap());
        assert_ne!(base, sign_request("s", "GET", "1", "/other", "").unwrap());
        assert_ne!(base, sign_request("s", "GET", "1", "/live", "{}").unwrap());
    }

    #[test]
    fn test_auth_frame_shape() {
        let creds = DeltaCredentials::new("key-1", "test-secret");
        let frame = creds.auth_frame_at(1_700_000_000).unwrap();
        let json = serde_json::to_value(&frame).unwrap();

        assert_eq!(json["type"], "auth");
        assert_eq!(json["payload"]["api_key"], "key-1");
        assert_eq!(json["payload"]["timestamp"], "1700000000");
        assert_eq!(
            json["payload"]["signature"],
            "18b3e4c6f67a3678e0e31a655eab20c9795208903e00cf68ab674869d8f39ed3"
        );
    }

    #[test]
    fn test_credentials_debug_redacted() {
        let creds = DeltaCredentials::new("key-1", "secret-1");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("key-1"));
        assert!(!debug.contains("secret-1"));
    }
}
