//! Typed view over the forwarding fields of an onion hop payload.
//!
//! Only the fields a forwarding node acts on are interpreted; every other
//! entry is carried through untouched. The payload sits inside an onion
//! packet whose HMAC covers a fixed length, so a rewrite must never change
//! the encoded size of the stream.

use crate::core::tlv::{TlvError, TlvStream};
use crate::proto::primitives::{Msat, ShortChannelId};

pub const TLV_AMT_TO_FORWARD: u64 = 2;
pub const TLV_OUTGOING_CLTV: u64 = 4;
pub const TLV_SHORT_CHANNEL_ID: u64 = 6;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OnionError {
    #[error("malformed TLV payload: {0}")]
    Tlv(#[from] TlvError),
    #[error("missing required TLV type {0}")]
    MissingField(u64),
    #[error("TLV type {typ} is {len} bytes, at most {max} allowed")]
    FieldTooLong { typ: u64, len: usize, max: usize },
    #[error("short_channel_id must be 8 bytes, got {0}")]
    BadShortChannelId(usize),
    #[error("amount {amount} needs {needed} bytes but the field is {width} bytes wide")]
    AmountTooWide {
        amount: Msat,
        needed: usize,
        width: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardPayload {
    stream: TlvStream,
    amt_to_forward: Msat,
    amt_width: usize,
    outgoing_cltv: u32,
    short_channel_id: Option<ShortChannelId>,
}

impl ForwardPayload {
    /// Decodes the length-prefixed payload handed to us by `htlc_accepted`.
    pub fn decode(payload: &[u8]) -> Result<Self, OnionError> {
        Self::from_stream(TlvStream::from_length_prefixed(payload)?)
    }

    pub fn from_stream(stream: TlvStream) -> Result<Self, OnionError> {
        let amt = stream
            .get(TLV_AMT_TO_FORWARD)
            .ok_or(OnionError::MissingField(TLV_AMT_TO_FORWARD))?;
        let amt_width = amt.value.len();
        let amt_to_forward = Msat(read_truncated(TLV_AMT_TO_FORWARD, &amt.value, 8)?);

        let cltv = stream
            .get(TLV_OUTGOING_CLTV)
            .ok_or(OnionError::MissingField(TLV_OUTGOING_CLTV))?;
        let outgoing_cltv = read_truncated(TLV_OUTGOING_CLTV, &cltv.value, 4)? as u32;

        let short_channel_id = match stream.get(TLV_SHORT_CHANNEL_ID) {
            Some(e) => {
                let raw: [u8; 8] = e
                    .value
                    .as_slice()
                    .try_into()
                    .map_err(|_| OnionError::BadShortChannelId(e.value.len()))?;
                Some(ShortChannelId::from(u64::from_be_bytes(raw)))
            }
            None => None,
        };

        Ok(Self {
            stream,
            amt_to_forward,
            amt_width,
            outgoing_cltv,
            short_channel_id,
        })
    }

    pub fn amt_to_forward(&self) -> Msat {
        self.amt_to_forward
    }

    /// Width in bytes of the encoded amount field.
    pub fn amt_width(&self) -> usize {
        self.amt_width
    }

    pub fn outgoing_cltv(&self) -> u32 {
        self.outgoing_cltv
    }

    pub fn short_channel_id(&self) -> Option<ShortChannelId> {
        self.short_channel_id
    }

    /// Returns a copy with `amt_to_forward` replaced, left-padded to the
    /// original field width. Fails if `amount` does not fit that width.
    pub fn with_amt_to_forward(&self, amount: Msat) -> Result<Self, OnionError> {
        let value = encode_fixed_width(amount, self.amt_width)?;
        let mut stream = self.stream.clone();
        if !stream.replace(TLV_AMT_TO_FORWARD, value) {
            return Err(OnionError::MissingField(TLV_AMT_TO_FORWARD));
        }
        Ok(Self {
            stream,
            amt_to_forward: amount,
            ..self.clone()
        })
    }

    /// The bare TLV stream, as expected by the `payload` field of a
    /// `continue` hook response.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.stream.to_bytes()
    }
}

fn read_truncated(typ: u64, bytes: &[u8], max: usize) -> Result<u64, OnionError> {
    if bytes.len() > max {
        return Err(OnionError::FieldTooLong {
            typ,
            len: bytes.len(),
            max,
        });
    }
    Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
}

fn encode_fixed_width(amount: Msat, width: usize) -> Result<Vec<u8>, OnionError> {
    let be = amount.msat().to_be_bytes();
    let needed = be.iter().skip_while(|&&b| b == 0).count();
    if needed > width {
        return Err(OnionError::AmountTooWide {
            amount,
            needed,
            width,
        });
    }
    let mut out = vec![0u8; width];
    out[width - needed..].copy_from_slice(&be[8 - needed..]);
    Ok(out)
}
