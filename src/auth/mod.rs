//! Authentication for the speech service connection.
//!
//! Token acquisition itself is an external concern; the core only needs a
//! provider it can ask for credentials before each dial, plus a dedicated
//! re-fetch path taken once when the service answers the open handshake with
//! HTTP 403 (expired credential).

use async_trait::async_trait;

use crate::error::SessionError;

/// Header name used for subscription-key authentication.
pub const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

/// Header name used for bearer-token authentication.
pub const AUTHORIZATION_HEADER: &str = "Authorization";

/// A credential ready to be attached to the connection handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    /// HTTP header the credential travels in.
    pub header_name: String,
    /// Header value (key or `Bearer <token>`).
    pub token: String,
}

impl AuthInfo {
    pub fn new(header_name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            header_name: header_name.into(),
            token: token.into(),
        }
    }
}

/// Credential source consulted by the connection manager.
///
/// `fetch` runs before every fresh dial; `fetch_on_expiry` runs instead when
/// the previous open attempt was rejected with 403, giving token-based
/// providers a chance to mint a fresh token rather than serve a cached one.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Fetch a credential. `auth_fetch_event_id` is a fresh opaque id minted
    /// per attempt; providers may use it to correlate telemetry.
    async fn fetch(&self, auth_fetch_event_id: &str) -> Result<AuthInfo, SessionError>;

    /// Fetch a credential after the previous one was rejected as expired.
    async fn fetch_on_expiry(&self, auth_fetch_event_id: &str) -> Result<AuthInfo, SessionError>;
}

/// Static subscription-key provider.
///
/// The key never expires client-side, so the expiry path serves the same
/// credential.
pub struct SubscriptionKeyAuth {
    info: AuthInfo,
}

impl SubscriptionKeyAuth {
    pub fn new(subscription_key: impl Into<String>) -> Result<Self, SessionError> {
        let key = subscription_key.into();
        if key.is_empty() {
            return Err(SessionError::ArgumentNull("subscription_key"));
        }
        Ok(Self {
            info: AuthInfo::new(SUBSCRIPTION_KEY_HEADER, key),
        })
    }
}

#[async_trait]
impl AuthProvider for SubscriptionKeyAuth {
    async fn fetch(&self, _auth_fetch_event_id: &str) -> Result<AuthInfo, SessionError> {
        Ok(self.info.clone())
    }

    async fn fetch_on_expiry(&self, _auth_fetch_event_id: &str) -> Result<AuthInfo, SessionError> {
        Ok(self.info.clone())
    }
}
