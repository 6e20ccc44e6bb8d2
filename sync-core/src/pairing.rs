//! Pairing tokens for Clipmesh.
//!
//! This module provides:
//! - Token issuance bound to the requesting device
//! - Time-limited tokens with expiration
//! - Single-use consumption
//!
//! The pairing flow:
//! 1. Device A asks the relay for a token and displays it
//! 2. Device B enters the token; the relay consumes it and pairs A with B
//! 3. Both devices hold the token and use it as a pre-shared secret for
//!    the public-key exchange that follows

use std::collections::HashMap;
use std::time::Duration;
use sync_types::DeviceId;

/// Default token TTL (120 seconds).
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_millis(120_000);

/// Error type for token operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// No such token (never issued, or already consumed).
    Unknown,
    /// The token exists but its TTL has elapsed.
    Expired,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Unknown => write!(f, "unknown pairing token"),
            TokenError::Expired => write!(f, "pairing token has expired"),
        }
    }
}

impl std::error::Error for TokenError {}

/// A single-use pairing token.
#[derive(Clone, PartialEq, Eq)]
pub struct PairingToken {
    /// The token string shown to the user.
    pub token: String,
    /// Device that requested the token.
    pub owner: DeviceId,
    /// Expiry in ms since the Unix epoch.
    pub expires_at: u64,
}

impl PairingToken {
    /// A token is expired from `expires_at` onward.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

// The token doubles as key material; keep it out of logs.
impl std::fmt::Debug for PairingToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingToken")
            .field("token", &"[REDACTED]")
            .field("owner", &self.owner)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Outstanding tokens, keyed by token string.
#[derive(Debug)]
pub struct TokenLedger {
    ttl_ms: u64,
    tokens: HashMap<String, PairingToken>,
}

impl TokenLedger {
    /// Create an empty ledger issuing tokens with the given TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl_ms: ttl.as_millis() as u64,
            tokens: HashMap::new(),
        }
    }

    /// Issue a fresh random token owned by `owner`.
    pub fn issue(&mut self, owner: DeviceId, now: u64) -> PairingToken {
        self.issue_named(uuid::Uuid::new_v4().to_string(), owner, now)
    }

    /// Issue a token with a caller-chosen string.
    ///
    /// Replaces any outstanding token with the same string.
    pub fn issue_named(&mut self, token: String, owner: DeviceId, now: u64) -> PairingToken {
        let issued = PairingToken {
            token: token.clone(),
            owner,
            expires_at: now.saturating_add(self.ttl_ms),
        };
        self.tokens.insert(token, issued.clone());
        issued
    }

    /// Look up a token that is still consumable, without consuming it.
    pub fn check(&self, token: &str, now: u64) -> Result<&PairingToken, TokenError> {
        let found = self.tokens.get(token).ok_or(TokenError::Unknown)?;
        if found.is_expired(now) {
            return Err(TokenError::Expired);
        }
        Ok(found)
    }

    /// Consume a token. It can never be used again afterwards.
    pub fn consume(&mut self, token: &str, now: u64) -> Result<PairingToken, TokenError> {
        self.check(token, now)?;
        self.tokens.remove(token).ok_or(TokenError::Unknown)
    }

    /// Drop every expired token. Returns how many were removed.
    pub fn purge_expired(&mut self, now: u64) -> usize {
        let before = self.tokens.len();
        self.tokens.retain(|_, t| !t.is_expired(now));
        before - self.tokens.len()
    }

    /// Number of outstanding tokens (including expired, not yet purged).
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// True if no tokens are outstanding.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Default for TokenLedger {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000_000;

    fn owner() -> DeviceId {
        DeviceId::new("device-a")
    }

    #[test]
    fn issued_token_expires_after_ttl() {
        let mut ledger = TokenLedger::default();
        let token = ledger.issue(owner(), T0);
        assert_eq!(token.expires_at, T0 + 120_000);
        assert_eq!(token.owner, owner());
    }

    #[test]
    fn issued_tokens_are_unique() {
        let mut ledger = TokenLedger::default();
        let a = ledger.issue(owner(), T0);
        let b = ledger.issue(owner(), T0);
        assert_ne!(a.token, b.token);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn token_is_single_use() {
        let mut ledger = TokenLedger::default();
        let token = ledger.issue(owner(), T0);

        assert!(ledger.consume(&token.token, T0 + 500).is_ok());
        assert_eq!(
            ledger.consume(&token.token, T0 + 600),
            Err(TokenError::Unknown)
        );
    }

    #[test]
    fn token_valid_strictly_before_expiry() {
        let mut ledger = TokenLedger::default();
        let token = ledger.issue_named("T".into(), owner(), T0);
        assert!(ledger.check("T", T0 + 119_999).is_ok());
        assert_eq!(ledger.check("T", T0 + 120_000), Err(TokenError::Expired));
        assert_eq!(ledger.consume("T", T0 + 120_001), Err(TokenError::Expired));
        assert_eq!(token.token, "T");
    }

    #[test]
    fn check_does_not_consume() {
        let mut ledger = TokenLedger::default();
        ledger.issue_named("T".into(), owner(), T0);
        assert!(ledger.check("T", T0).is_ok());
        assert!(ledger.check("T", T0).is_ok());
        assert!(ledger.consume("T", T0).is_ok());
    }

    #[test]
    fn unknown_token_rejected() {
        let ledger = TokenLedger::default();
        assert_eq!(ledger.check("nope", T0), Err(TokenError::Unknown));
    }

    #[test]
    fn purge_removes_only_expired() {
        let mut ledger = TokenLedger::new(Duration::from_secs(10));
        ledger.issue_named("old".into(), owner(), T0);
        ledger.issue_named("new".into(), owner(), T0 + 5_000);

        assert_eq!(ledger.purge_expired(T0 + 10_000), 1);
        assert_eq!(ledger.len(), 1);
        assert!(ledger.check("new", T0 + 10_000).is_ok());
    }

    #[test]
    fn token_debug_is_redacted() {
        let mut ledger = TokenLedger::default();
        let token = ledger.issue_named("super-secret".into(), owner(), T0);
        let debug = format!("{:?}", token);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn error_display() {
        assert_eq!(TokenError::Expired.to_string(), "pairing token has expired");
    }
}
