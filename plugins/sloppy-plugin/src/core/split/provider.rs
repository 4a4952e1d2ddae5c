use anyhow::Result;
use async_trait::async_trait;

use super::session::{Exclusion, SplitEvent};
use crate::proto::primitives::{FeePolicy, Msat, PaymentHash, Preimage, PublicKey, ShortChannelId};

// ============================================================================
// Channel Directory
// ============================================================================

/// Our side of a channel, as seen by the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerChannel {
    pub short_channel_id: ShortChannelId,
    pub peer_id: PublicKey,
    pub peer_connected: bool,
    /// The channel is in a state where it can add HTLCs.
    pub active: bool,
    pub spendable: Msat,
    /// Direction of the half-channel we send on.
    pub direction: u8,
    /// The fee we charge for forwarding into this channel.
    pub fee_policy: FeePolicy,
}

#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    /// Looks up a channel we have by its short channel id.
    async fn get_channel(&self, scid: &ShortChannelId) -> Result<Option<PeerChannel>>;

    /// True if the peer advertised the split feature bit in its init message.
    async fn peer_supports_split(&self, peer_id: &PublicKey) -> Result<bool>;
}

// ============================================================================
// Payments
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteHop {
    pub id: PublicKey,
    pub channel: ShortChannelId,
    pub direction: u8,
    pub amount: Msat,
    pub delay: u32,
}

/// First hop of an onion we pass on without building it ourselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstHop {
    pub id: PublicKey,
    pub amount: Msat,
    pub delay: u32,
}

/// What went wrong with a payment attempt, as far as it is known.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureDetail {
    pub erring_channel: Option<ShortChannelId>,
    pub erring_direction: Option<u8>,
    pub erring_node: Option<PublicKey>,
    /// Encrypted failure onion from downstream, if we could not decrypt it.
    pub onion_reply: Option<Vec<u8>>,
    pub message: String,
}

impl FailureDetail {
    /// The failing half-channel, when both parts are known.
    pub fn erring_edge(&self) -> Option<Exclusion> {
        Some(Exclusion::new(self.erring_channel?, self.erring_direction?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    Settled(Preimage),
    Failed(FailureDetail),
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Returns `None` if no route exists under the given exclusions.
    async fn find_route(
        &self,
        destination: &PublicKey,
        amount: Msat,
        exclusions: &[Exclusion],
    ) -> Result<Option<Vec<RouteHop>>>;

    async fn send_route(&self, route: &[RouteHop], payment_hash: &PaymentHash) -> Result<()>;

    async fn send_onion(
        &self,
        first_hop: &FirstHop,
        onion: &[u8],
        payment_hash: &PaymentHash,
    ) -> Result<()>;

    /// Waits for the outcome of the last payment sent for this hash.
    async fn await_outcome(&self, payment_hash: &PaymentHash) -> Result<PaymentOutcome>;
}

// ============================================================================
// Peer Messaging
// ============================================================================

#[async_trait]
pub trait PeerMessenger: Send + Sync {
    async fn send_custom_msg(&self, peer_id: &PublicKey, msg: &[u8]) -> Result<()>;
}

// ============================================================================
// Event Emitters
// ============================================================================

/// Receives split events for telemetry. Implementations must not block.
#[async_trait]
pub trait SplitEventEmitter: Send + Sync {
    async fn emit(&self, event: SplitEvent);
}

/// Writes events to the plugin log.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventEmitter;

#[async_trait]
impl SplitEventEmitter for LoggingEventEmitter {
    async fn emit(&self, event: SplitEvent) {
        match &event {
            SplitEvent::SessionFailed { .. } | SplitEvent::AlternateAttemptFailed { .. } => {
                log::info!("split event: {:?}", event)
            }
            _ => log::debug!("split event: {:?}", event),
        }
    }
}
