//! Split wire messages.
//!
//! Both messages travel as custom peer messages: a 2-byte big-endian type
//! followed by the payment hash as 64 lowercase ASCII hex characters. There
//! is no version field; new messages get new type codes.

use crate::proto::primitives::PaymentHash;

/// Tells the next hop that the HTLC for this payment hash arrives in more
/// than one leg.
pub const SPLIT_ANNOUNCE: u16 = 44203;
/// Tells the next hop that the remainder could not be delivered.
pub const SPLIT_FAIL: u16 = 44205;

const HASH_HEX_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("message too short: {0} bytes")]
    TooShort(usize),
    #[error("unknown message type {0}")]
    UnknownType(u16),
    #[error("expected 64 hex chars of payment hash, got {0}")]
    BadLength(usize),
    #[error("payment hash is not valid hex")]
    BadHex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitMessage {
    Announce(PaymentHash),
    Fail(PaymentHash),
}

impl SplitMessage {
    pub fn type_code(&self) -> u16 {
        match self {
            SplitMessage::Announce(_) => SPLIT_ANNOUNCE,
            SplitMessage::Fail(_) => SPLIT_FAIL,
        }
    }

    pub fn payment_hash(&self) -> PaymentHash {
        match self {
            SplitMessage::Announce(h) | SplitMessage::Fail(h) => *h,
        }
    }

    /// True if the first two bytes carry one of our type codes.
    pub fn is_split_message(raw: &[u8]) -> bool {
        raw.len() >= 2 && matches!(u16::from_be_bytes([raw[0], raw[1]]), SPLIT_ANNOUNCE | SPLIT_FAIL)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + HASH_HEX_LEN);
        out.extend_from_slice(&self.type_code().to_be_bytes());
        out.extend_from_slice(hex::encode(self.payment_hash().as_bytes()).as_bytes());
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self, MessageError> {
        if raw.len() < 2 {
            return Err(MessageError::TooShort(raw.len()));
        }
        let (typ, body) = raw.split_at(2);
        let typ = u16::from_be_bytes([typ[0], typ[1]]);
        if typ != SPLIT_ANNOUNCE && typ != SPLIT_FAIL {
            return Err(MessageError::UnknownType(typ));
        }
        if body.len() != HASH_HEX_LEN {
            return Err(MessageError::BadLength(body.len()));
        }
        let bytes = hex::decode(body).map_err(|_| MessageError::BadHex)?;
        let hash = PaymentHash::from_slice(&bytes).ok_or(MessageError::BadHex)?;
        Ok(match typ {
            SPLIT_ANNOUNCE => SplitMessage::Announce(hash),
            _ => SplitMessage::Fail(hash),
        })
    }
}
