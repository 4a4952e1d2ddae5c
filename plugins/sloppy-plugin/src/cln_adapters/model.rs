//! JSON shapes exchanged with `lightningd`: hook payloads and the raw RPC
//! requests and responses the adapters use.

use cln_rpc::primitives::Amount;
use hex::FromHex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::core::split::continuation::{HtlcResponse, LegId};
use crate::core::split::gatekeeper::IncomingHtlc;
use crate::proto::primitives::{Msat, PaymentHash, Preimage, PublicKey, ShortChannelId};

// ============================================================================
// htlc_accepted
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct Onion {
    /// Our hop payload, with its BigSize length prefix.
    #[serde(deserialize_with = "from_hex")]
    pub payload: Vec<u8>,
    #[serde(default, deserialize_with = "from_hex_opt")]
    pub next_onion: Option<Vec<u8>>,
}

#[derive(Debug, Deserialize)]
pub struct Htlc {
    pub short_channel_id: ShortChannelId,
    pub id: u64,
    pub amount_msat: Amount,
    pub cltv_expiry: u32,
    pub payment_hash: PaymentHash,
}

#[derive(Debug, Deserialize)]
pub struct HtlcAcceptedRequest {
    pub htlc: Htlc,
    pub onion: Onion,
}

impl From<HtlcAcceptedRequest> for IncomingHtlc {
    fn from(req: HtlcAcceptedRequest) -> Self {
        IncomingHtlc {
            leg: LegId {
                in_channel: req.htlc.short_channel_id,
                htlc_id: req.htlc.id,
            },
            payment_hash: req.htlc.payment_hash,
            amount: Msat(req.htlc.amount_msat.msat()),
            cltv_expiry: req.htlc.cltv_expiry,
            payload: req.onion.payload,
            next_onion: req.onion.next_onion,
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct HtlcAcceptedResponse {
    result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payment_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_onion: Option<String>,
}

impl HtlcAcceptedResponse {
    fn new(result: &'static str) -> Self {
        Self {
            result,
            payload: None,
            payment_key: None,
            failure_message: None,
            failure_onion: None,
        }
    }

    pub fn continue_unmodified() -> Self {
        Self::new("continue")
    }
}

impl From<HtlcResponse> for HtlcAcceptedResponse {
    fn from(response: HtlcResponse) -> Self {
        match response {
            HtlcResponse::Continue => Self::continue_unmodified(),
            HtlcResponse::ContinueWithPayload { payload } => Self {
                payload: Some(hex::encode(payload)),
                ..Self::new("continue")
            },
            HtlcResponse::Resolve { preimage } => Self {
                payment_key: Some(preimage.to_string()),
                ..Self::new("resolve")
            },
            HtlcResponse::Fail { failure_code } => Self {
                failure_message: Some(hex::encode(failure_code.to_bytes())),
                ..Self::new("fail")
            },
            HtlcResponse::FailWithOnion { onion_reply } => Self {
                failure_onion: Some(hex::encode(onion_reply)),
                ..Self::new("fail")
            },
        }
    }
}

// ============================================================================
// custommsg
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CustomMsgRequest {
    pub peer_id: PublicKey,
    #[serde(deserialize_with = "from_hex")]
    pub payload: Vec<u8>,
}

// ============================================================================
// RPC
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ListPeerChannelsRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_channel_id: Option<ShortChannelId>,
}

#[derive(Debug, Deserialize)]
pub struct ListPeerChannelsResponse {
    pub channels: Vec<PeerChannelEntry>,
}

#[derive(Debug, Deserialize)]
pub struct PeerChannelEntry {
    pub peer_id: PublicKey,
    pub peer_connected: bool,
    pub state: String,
    pub short_channel_id: Option<ShortChannelId>,
    pub direction: Option<u8>,
    pub spendable_msat: Option<Amount>,
    pub fee_base_msat: Option<Amount>,
    pub fee_proportional_millionths: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ListPeersRequest {
    pub id: PublicKey,
}

#[derive(Debug, Deserialize)]
pub struct ListPeersResponse {
    pub peers: Vec<PeerEntry>,
}

#[derive(Debug, Deserialize)]
pub struct PeerEntry {
    pub id: PublicKey,
    pub connected: bool,
    /// Features from the peer's init message, big-endian hex.
    pub features: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GetRouteRequest {
    pub id: PublicKey,
    pub amount_msat: Amount,
    pub riskfactor: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct GetRouteResponse {
    pub route: Vec<RouteHopJson>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteHopJson {
    pub id: PublicKey,
    pub channel: ShortChannelId,
    pub direction: u8,
    pub amount_msat: Amount,
    pub delay: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SendPayRequest {
    pub route: Vec<RouteHopJson>,
    pub payment_hash: PaymentHash,
}

#[derive(Debug, Serialize)]
pub struct FirstHopJson {
    pub id: PublicKey,
    pub amount_msat: Amount,
    pub delay: u32,
}

#[derive(Debug, Serialize)]
pub struct SendOnionRequest {
    pub onion: String,
    pub first_hop: FirstHopJson,
    pub payment_hash: PaymentHash,
}

#[derive(Debug, Serialize)]
pub struct WaitSendPayRequest {
    pub payment_hash: PaymentHash,
}

#[derive(Debug, Deserialize)]
pub struct WaitSendPayResponse {
    pub status: String,
    pub payment_preimage: Option<Preimage>,
}

/// `data` of a failed `waitsendpay`.
#[derive(Debug, Default, Deserialize)]
pub struct WaitSendPayErrorData {
    pub erring_channel: Option<ShortChannelId>,
    pub erring_direction: Option<u8>,
    pub erring_node: Option<PublicKey>,
    pub failcodename: Option<String>,
    #[serde(default, deserialize_with = "from_hex_opt")]
    pub onionreply: Option<Vec<u8>>,
}

#[derive(Debug, Serialize)]
pub struct SendCustomMsgRequest {
    pub node_id: PublicKey,
    pub msg: String,
}

/// Responses we do not need to read.
#[derive(Debug, Deserialize)]
pub struct Ignored {}

// ============================================================================
// Hex helpers
// ============================================================================

/// Deserializes a hex string to a `Vec<u8>`.
pub fn from_hex<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    String::deserialize(deserializer)
        .and_then(|string| Vec::from_hex(string).map_err(|err| Error::custom(err.to_string())))
}

pub fn from_hex_opt<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    match Option::<String>::deserialize(deserializer)? {
        Some(s) => Vec::from_hex(s)
            .map(Some)
            .map_err(|err| Error::custom(err.to_string())),
        None => Ok(None),
    }
}
