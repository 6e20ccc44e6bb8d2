//! Encrypted public-key exchange riding on a pairing token.
//!
//! Both the device that requested a token and the device that entered it
//! hold the token until the peer's sealed key arrives. Whoever holds it
//! seals its own public key for the peer after `pair_success`.

use crate::crypto::{CryptoError, PairingKey};
use sync_types::SealedKey;
use zeroize::Zeroizing;

/// The token currently held for a pairing in progress.
#[derive(Default)]
pub struct Handshake {
    token: Option<Zeroizing<String>>,
}

impl Handshake {
    /// Create an empty handshake.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `token`, replacing any previous one.
    pub fn hold(&mut self, token: impl Into<String>) {
        self.token = Some(Zeroizing::new(token.into()));
    }

    /// Whether a token is held.
    pub fn is_holding(&self) -> bool {
        self.token.is_some()
    }

    /// Forget the held token.
    pub fn clear(&mut self) {
        self.token = None;
    }

    /// Seal our public key for the peer. `None` when no token is held.
    pub fn seal_for_peer(&self, own_public_key: &str) -> Result<Option<SealedKey>, CryptoError> {
        let Some(token) = &self.token else {
            return Ok(None);
        };
        let key = PairingKey::derive(token)?;
        key.seal(own_public_key.as_bytes()).map(Some)
    }

    /// Open a peer's sealed key with the held token.
    ///
    /// On success the token is cleared and the peer's public key returned.
    /// Any failure leaves the token in place and yields `None`.
    pub fn accept_key(&mut self, sealed: &SealedKey) -> Option<String> {
        let token = self.token.as_ref()?;
        let opened = PairingKey::derive(token).and_then(|key| key.open(sealed));
        match opened {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(public_key) => {
                    self.clear();
                    Some(public_key)
                }
                Err(_) => {
                    tracing::debug!("Discarding pair_key: not UTF-8");
                    None
                }
            },
            Err(e) => {
                tracing::debug!("Discarding pair_key: {}", e);
                None
            }
        }
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutual_exchange_with_shared_token() {
        let mut a = Handshake::new();
        let mut b = Handshake::new();
        a.hold("tok");
        b.hold("tok");

        let from_a = a.seal_for_peer("pk-a").unwrap().unwrap();
        let from_b = b.seal_for_peer("pk-b").unwrap().unwrap();

        assert_eq!(b.accept_key(&from_a).as_deref(), Some("pk-a"));
        assert_eq!(a.accept_key(&from_b).as_deref(), Some("pk-b"));
        assert!(!a.is_holding());
        assert!(!b.is_holding());
    }

    #[test]
    fn nothing_to_seal_without_token() {
        let handshake = Handshake::new();
        assert!(handshake.seal_for_peer("pk").unwrap().is_none());
    }

    #[test]
    fn wrong_token_is_swallowed_and_token_kept() {
        let mut sender = Handshake::new();
        sender.hold("one");
        let sealed = sender.seal_for_peer("pk").unwrap().unwrap();

        let mut receiver = Handshake::new();
        receiver.hold("two");
        assert!(receiver.accept_key(&sealed).is_none());
        assert!(receiver.is_holding());
    }

    #[test]
    fn key_without_held_token_is_ignored() {
        let mut sender = Handshake::new();
        sender.hold("one");
        let sealed = sender.seal_for_peer("pk").unwrap().unwrap();
        assert!(Handshake::new().accept_key(&sealed).is_none());
    }

    #[test]
    fn debug_redacts_token() {
        let mut handshake = Handshake::new();
        handshake.hold("secret-token");
        let printed = format!("{handshake:?}");
        assert!(!printed.contains("secret-token"));
        assert!(printed.contains("REDACTED"));
    }
}
