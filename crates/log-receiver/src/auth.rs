//! Authentication session: the `AUTHENTICATE` handshake, principal identity,
//! and the transport filter swap that follows a successful re-auth.
//!
//! `AuthContext` is the pluggable credential store the session consults;
//! `AuthSession` is the per-connection state machine that drives the
//! handshake and enforces its contracts: principal immutability, no
//! cleartext downgrade, queued responses during re-auth.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::ConnectionError;
use crate::filter::Filter;

type HmacSha256 = Hmac<Sha256>;

/// A single `AUTHENTICATE` RPC as parsed off the wire.
#[derive(Debug, Clone)]
pub struct AuthenticateRequest {
    pub method: String,
    pub content: Vec<u8>,
    pub filter_requested: bool,
}

/// What an `AuthContext` produces for a successful (or failed) handshake.
pub struct AuthenticateResponse {
    pub content: Vec<u8>,
    /// Empty when the context does not assign an identity (e.g. disabled
    /// auth); a non-empty name is checked for consistency against any prior
    /// name on this connection.
    pub principal_name: String,
    pub session_expires_at: SystemTime,
    pub filter: Option<Box<dyn Filter>>,
}

/// Pluggable credential store consulted by the auth session.
pub trait AuthContext: Send + Sync {
    fn is_auth_required(&self) -> bool;
    /// Monotonically increasing counter bumped whenever the underlying
    /// credential table changes (secret rotation, reload). A session whose
    /// snapshot is stale must re-authenticate.
    fn get_update_count(&self) -> u64;
    fn validate(&self, request: &AuthenticateRequest) -> Result<(), ConnectionError>;
    fn authenticate(&self, request: &AuthenticateRequest) -> Result<AuthenticateResponse, ConnectionError>;
    fn remap_and_validate(&self, name: &str) -> Result<String, ConnectionError>;
    fn get_uid(&self, name: &str) -> Option<u32>;
    fn has_user_and_group(&self) -> bool;
}

/// Auth never required; every handshake succeeds with no assigned identity
/// and no filter. Used when the receiver is configured without a secret
/// table.
#[derive(Debug, Default)]
pub struct DisabledAuth;

impl AuthContext for DisabledAuth {
    fn is_auth_required(&self) -> bool {
        false
    }

    fn get_update_count(&self) -> u64 {
        0
    }

    fn validate(&self, _request: &AuthenticateRequest) -> Result<(), ConnectionError> {
        Ok(())
    }

    fn authenticate(&self, _request: &AuthenticateRequest) -> Result<AuthenticateResponse, ConnectionError> {
        Ok(AuthenticateResponse {
            content: Vec::new(),
            principal_name: String::new(),
            session_expires_at: SystemTime::now() + Duration::from_secs(60 * 60 * 24 * 365 * 10),
            filter: None,
        })
    }

    fn remap_and_validate(&self, name: &str) -> Result<String, ConnectionError> {
        Ok(name.to_string())
    }

    fn get_uid(&self, _name: &str) -> Option<u32> {
        None
    }

    fn has_user_and_group(&self) -> bool {
        false
    }
}

/// Challenge/response against a configured shared-secret table, keyed by
/// principal name. The response for method `"HMAC-SHA256"` is
/// `HMAC-SHA256(secret, method)`, mirroring the digest-over-secret-and-
/// challenge shape used elsewhere in this codebase's rsync-style auth.
pub struct SharedSecretAuth {
    secrets: RwLock<HashMap<String, Vec<u8>>>,
    update_count: AtomicU64,
    session_ttl: Duration,
}

impl SharedSecretAuth {
    #[must_use]
    pub fn new(secrets: HashMap<String, Vec<u8>>, session_ttl: Duration) -> Self {
        Self { secrets: RwLock::new(secrets), update_count: AtomicU64::new(0), session_ttl }
    }

    /// Replaces the secret table, bumping `get_update_count()` so that
    /// already-authenticated sessions are forced to re-auth.
    pub fn reload(&self, secrets: HashMap<String, Vec<u8>>) {
        *self.secrets.write().expect("secrets lock poisoned") = secrets;
        self.update_count.fetch_add(1, Ordering::SeqCst);
    }
}

impl AuthContext for SharedSecretAuth {
    fn is_auth_required(&self) -> bool {
        true
    }

    fn get_update_count(&self) -> u64 {
        self.update_count.load(Ordering::SeqCst)
    }

    fn validate(&self, request: &AuthenticateRequest) -> Result<(), ConnectionError> {
        if request.method != "HMAC-SHA256" {
            return Err(ConnectionError::AuthenticationFailed(format!(
                "unsupported method: {}",
                request.method
            )));
        }
        Ok(())
    }

    fn authenticate(&self, request: &AuthenticateRequest) -> Result<AuthenticateResponse, ConnectionError> {
        self.validate(request)?;
        let newline = request
            .content
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| ConnectionError::AuthenticationFailed("malformed credentials".into()))?;
        let name = std::str::from_utf8(&request.content[..newline])
            .map_err(|_| ConnectionError::AuthenticationFailed("malformed credentials".into()))?;
        let response = &request.content[newline + 1..];

        let secrets = self.secrets.read().expect("secrets lock poisoned");
        let secret = secrets
            .get(name)
            .ok_or_else(|| ConnectionError::AuthenticationFailed("unknown principal".into()))?;
        let mut mac = HmacSha256::new_from_slice(secret).expect("hmac key accepts any length");
        mac.update(request.method.as_bytes());
        mac.verify_slice(response)
            .map_err(|_| ConnectionError::AuthenticationFailed("credential mismatch".into()))?;

        Ok(AuthenticateResponse {
            content: Vec::new(),
            principal_name: name.to_string(),
            session_expires_at: SystemTime::now() + self.session_ttl,
            filter: None,
        })
    }

    fn remap_and_validate(&self, name: &str) -> Result<String, ConnectionError> {
        let secrets = self.secrets.read().expect("secrets lock poisoned");
        if secrets.contains_key(name) {
            Ok(name.to_string())
        } else {
            Err(ConnectionError::AuthenticationFailed("unknown principal".into()))
        }
    }

    fn get_uid(&self, _name: &str) -> Option<u32> {
        None
    }

    fn has_user_and_group(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Fresh,
    Authenticating,
    Authenticated,
    Reauthenticating,
    Down,
}

/// A handshake that validated but whose filter swap (if any) is waiting on
/// the old filter to drain and shut down.
struct PendingHandshake {
    principal_name: String,
    session_expires_at: SystemTime,
    update_count: u64,
    new_filter: Option<Box<dyn Filter>>,
}

/// Per-connection auth state machine:
/// `Fresh -> Authenticating -> Authenticated [-> Reauthenticating -> Authenticated]* -> Down`.
pub struct AuthSession {
    state: AuthState,
    principal_name: Option<String>,
    session_expires_at: Option<SystemTime>,
    auth_ctx_update_count: u64,
    filter: Option<Box<dyn Filter>>,
    pending: Option<PendingHandshake>,
    pending_responses: Vec<Vec<u8>>,
}

impl AuthSession {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AuthState::Fresh,
            principal_name: None,
            session_expires_at: None,
            auth_ctx_update_count: 0,
            filter: None,
            pending: None,
            pending_responses: Vec::new(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> AuthState {
        self.state
    }

    #[must_use]
    pub fn principal_name(&self) -> Option<&str> {
        self.principal_name.as_deref()
    }

    #[must_use]
    pub const fn is_reauthenticating(&self) -> bool {
        matches!(self.state, AuthState::Reauthenticating)
    }

    /// Begins a handshake. Only valid from `Fresh` (first auth) or
    /// `Authenticated` (re-auth); any other state means data arrived while a
    /// handshake was already in flight.
    pub fn begin(&mut self) -> Result<(), ConnectionError> {
        match self.state {
            AuthState::Fresh => {
                self.state = AuthState::Authenticating;
                Ok(())
            }
            AuthState::Authenticated => {
                self.state = AuthState::Reauthenticating;
                Ok(())
            }
            AuthState::Authenticating | AuthState::Reauthenticating | AuthState::Down => {
                Err(ConnectionError::OutOfOrderData)
            }
        }
    }

    /// Validates a completed `authenticate()` response against this
    /// session's existing identity and filter, and stages it for
    /// installation once the response has finished writing. Does not yet
    /// mutate `principal_name`/`filter`/expiry — see [`Self::finish_write`].
    pub fn validate_and_stage(
        &mut self,
        response: AuthenticateResponse,
        ctx_update_count: u64,
    ) -> Result<(), ConnectionError> {
        if let Some(existing) = &self.principal_name {
            if !response.principal_name.is_empty() && existing != &response.principal_name {
                return Err(ConnectionError::AuthNameMismatch);
            }
        }
        if self.filter.is_some() && response.filter.is_none() {
            return Err(ConnectionError::CleartextDowngrade);
        }

        let principal_name = if response.principal_name.is_empty() {
            self.principal_name.clone().unwrap_or_default()
        } else {
            response.principal_name
        };

        self.pending = Some(PendingHandshake {
            principal_name,
            session_expires_at: response.session_expires_at,
            update_count: ctx_update_count,
            new_filter: response.filter,
        });
        Ok(())
    }

    /// Drives the deferred filter install. Called once the handshake
    /// response has finished writing (a `WROTE` event); may need to be
    /// called again on subsequent `WROTE` events if the prior filter has not
    /// yet drained. Returns `true` once the handshake is fully complete.
    pub fn finish_write(&mut self) -> bool {
        let Some(pending) = &mut self.pending else {
            return true;
        };

        if let Some(old_filter) = &mut self.filter {
            if pending.new_filter.is_some() {
                if !old_filter.drain() {
                    return false;
                }
                old_filter.shutdown();
                if !old_filter.is_shutdown_received() {
                    return false;
                }
            }
        }

        let pending = self.pending.take().expect("checked Some above");
        self.principal_name = Some(pending.principal_name);
        self.session_expires_at = Some(pending.session_expires_at);
        self.auth_ctx_update_count = pending.update_count;
        if let Some(new_filter) = pending.new_filter {
            self.filter = Some(new_filter);
        }
        self.state = AuthState::Authenticated;
        true
    }

    /// Fails the in-flight handshake, tearing the connection down. The
    /// caller is responsible for sending the failure response first.
    pub fn fail(&mut self) {
        self.pending = None;
        self.state = AuthState::Down;
    }

    /// Whether a re-auth should be requested on the next ack, per the ack
    /// path's `needs_reauth` formula.
    #[must_use]
    pub fn needs_reauth(&self, ctx: &dyn AuthContext, reauth_timeout: Duration, now: SystemTime) -> bool {
        if !ctx.is_auth_required() {
            return false;
        }
        let Some(expires_at) = self.session_expires_at else {
            return false;
        };
        ctx.get_update_count() != self.auth_ctx_update_count
            || expires_at <= now + reauth_timeout
    }

    /// Queues a response while a re-auth is in progress.
    pub fn queue_response(&mut self, bytes: Vec<u8>) {
        self.pending_responses.push(bytes);
    }

    /// Drains and returns queued responses, in arrival order, once the
    /// re-auth that suspended them has completed.
    pub fn take_pending_responses(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.pending_responses)
    }

    pub fn mark_down(&mut self) {
        self.state = AuthState::Down;
    }

    /// Wraps outbound plaintext through the installed transport filter, or
    /// passes it through unchanged before any filter has been negotiated.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        match &mut self.filter {
            Some(filter) => filter.encrypt(plaintext),
            None => Ok(plaintext.to_vec()),
        }
    }

    /// Unwraps inbound ciphertext through the installed transport filter, or
    /// passes it through unchanged before any filter has been negotiated.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        match &mut self.filter {
            Some(filter) => filter.decrypt(ciphertext),
            None => Ok(ciphertext.to_vec()),
        }
    }
}

impl Default for AuthSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::NullFilter;

    fn request(name: &str, secret: &[u8]) -> AuthenticateRequest {
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(b"HMAC-SHA256");
        let tag = mac.finalize().into_bytes();
        let mut content = format!("{name}\n").into_bytes();
        content.extend_from_slice(&tag);
        AuthenticateRequest { method: "HMAC-SHA256".to_string(), content, filter_requested: false }
    }

    #[test]
    fn shared_secret_auth_accepts_correct_response() {
        let mut secrets = HashMap::new();
        secrets.insert("alice".to_string(), b"sekrit".to_vec());
        let ctx = SharedSecretAuth::new(secrets, Duration::from_secs(3600));
        let response = ctx.authenticate(&request("alice", b"sekrit")).unwrap();
        assert_eq!(response.principal_name, "alice");
    }

    #[test]
    fn shared_secret_auth_rejects_wrong_secret() {
        let mut secrets = HashMap::new();
        secrets.insert("alice".to_string(), b"sekrit".to_vec());
        let ctx = SharedSecretAuth::new(secrets, Duration::from_secs(3600));
        assert!(ctx.authenticate(&request("alice", b"wrong")).is_err());
    }

    #[test]
    fn session_rejects_name_change_on_reauth() {
        let mut session = AuthSession::new();
        session.begin().unwrap();
        session
            .validate_and_stage(
                AuthenticateResponse {
                    content: Vec::new(),
                    principal_name: "alice".to_string(),
                    session_expires_at: SystemTime::now() + Duration::from_secs(60),
                    filter: None,
                },
                1,
            )
            .unwrap();
        assert!(session.finish_write());
        assert_eq!(session.principal_name(), Some("alice"));

        session.begin().unwrap();
        let err = session.validate_and_stage(
            AuthenticateResponse {
                content: Vec::new(),
                principal_name: "bob".to_string(),
                session_expires_at: SystemTime::now() + Duration::from_secs(60),
                filter: None,
            },
            2,
        );
        assert!(matches!(err, Err(ConnectionError::AuthNameMismatch)));
    }

    #[test]
    fn session_rejects_cleartext_downgrade() {
        let mut session = AuthSession::new();
        session.begin().unwrap();
        session
            .validate_and_stage(
                AuthenticateResponse {
                    content: Vec::new(),
                    principal_name: "alice".to_string(),
                    session_expires_at: SystemTime::now() + Duration::from_secs(60),
                    filter: Some(Box::new(NullFilter)),
                },
                1,
            )
            .unwrap();
        assert!(session.finish_write());

        session.begin().unwrap();
        let err = session.validate_and_stage(
            AuthenticateResponse {
                content: Vec::new(),
                principal_name: "alice".to_string(),
                session_expires_at: SystemTime::now() + Duration::from_secs(60),
                filter: None,
            },
            1,
        );
        assert!(matches!(err, Err(ConnectionError::CleartextDowngrade)));
    }

    #[test]
    fn begin_rejects_concurrent_handshake() {
        let mut session = AuthSession::new();
        session.begin().unwrap();
        assert!(matches!(session.begin(), Err(ConnectionError::OutOfOrderData)));
    }

    #[test]
    fn needs_reauth_on_stale_update_count() {
        struct FakeCtx(AtomicU64);
        impl AuthContext for FakeCtx {
            fn is_auth_required(&self) -> bool {
                true
            }
            fn get_update_count(&self) -> u64 {
                self.0.load(Ordering::SeqCst)
            }
            fn validate(&self, _r: &AuthenticateRequest) -> Result<(), ConnectionError> {
                Ok(())
            }
            fn authenticate(&self, _r: &AuthenticateRequest) -> Result<AuthenticateResponse, ConnectionError> {
                unreachable!()
            }
            fn remap_and_validate(&self, name: &str) -> Result<String, ConnectionError> {
                Ok(name.to_string())
            }
            fn get_uid(&self, _name: &str) -> Option<u32> {
                None
            }
            fn has_user_and_group(&self) -> bool {
                false
            }
        }

        let mut session = AuthSession::new();
        session.begin().unwrap();
        session
            .validate_and_stage(
                AuthenticateResponse {
                    content: Vec::new(),
                    principal_name: "alice".to_string(),
                    session_expires_at: SystemTime::now() + Duration::from_secs(3600),
                    filter: None,
                },
                0,
            )
            .unwrap();
        assert!(session.finish_write());

        let ctx = FakeCtx(AtomicU64::new(0));
        assert!(!session.needs_reauth(&ctx, Duration::from_secs(60), SystemTime::now()));
        ctx.0.store(1, Ordering::SeqCst);
        assert!(session.needs_reauth(&ctx, Duration::from_secs(60), SystemTime::now()));
    }
}
