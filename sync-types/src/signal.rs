//! Payloads carried inside relay `signal` messages.
//!
//! The relay never looks at these; only the two paired devices do.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::WireMessage;

/// Device-to-device signaling payloads.
///
/// Session descriptions and candidates are opaque values owned by the
/// negotiation backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    /// Connection offer from the initiator.
    Offer {
        /// Session description.
        sdp: Value,
    },
    /// Answer to an offer.
    Answer {
        /// Session description.
        sdp: Value,
    },
    /// One transport-address candidate.
    Ice {
        /// Candidate description.
        candidate: Value,
    },
    /// A public key sealed under the pairing token.
    PairKey {
        /// Sealed key.
        data: SealedKey,
    },
}

impl WireMessage for SignalPayload {
    const TAG: &'static str = "type";
    const KINDS: &'static [&'static str] = &["offer", "answer", "ice", "pair_key"];
}

/// Authenticated ciphertext with its nonce and tag, each base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey {
    /// Nonce.
    pub iv: String,
    /// Ciphertext without the tag.
    #[serde(alias = "data")]
    pub ciphertext: String,
    /// Authentication tag.
    pub tag: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pair_key_wire_shape() {
        let payload = SignalPayload::PairKey {
            data: SealedKey {
                iv: "aXY=".into(),
                ciphertext: "Y3Q=".into(),
                tag: "dGFn".into(),
            },
        };
        assert_eq!(
            payload.to_value().unwrap(),
            json!({"type":"pair_key","data":{"iv":"aXY=","ciphertext":"Y3Q=","tag":"dGFn"}})
        );
    }

    #[test]
    fn sealed_key_accepts_data_alias() {
        let value = json!({"type":"pair_key","data":{"iv":"a","data":"b","tag":"c"}});
        match SignalPayload::from_value(value).unwrap() {
            SignalPayload::PairKey { data } => assert_eq!(data.ciphertext, "b"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
