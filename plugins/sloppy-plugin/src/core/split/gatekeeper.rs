//! HTLC Gatekeeper
//!
//! Decides for every incoming HTLC whether it is a leg of a split we
//! receive, an HTLC that fits the next channel, or one we split. Anything
//! we cannot judge passes through unmodified.

use log::{debug, info, warn};
use tokio::task::JoinHandle;

use super::aggregator::{Aggregator, LegDecision};
use super::continuation::{Continuation, HtlcResponse, LegId};
use super::error::SplitError;
use super::messaging::SplitMessaging;
use super::provider::PeerChannel;
use super::route_finder::{RouteFinder, SearchOutcome};
use super::session::{Exclusion, Role, SplitEvent, SplitSession};
use super::SplitContext;
use crate::core::onion::ForwardPayload;
use crate::proto::primitives::{Msat, PaymentHash};

/// An HTLC as handed to us by the interception hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingHtlc {
    pub leg: LegId,
    pub payment_hash: PaymentHash,
    pub amount: Msat,
    pub cltv_expiry: u32,
    /// Our hop payload, including its BigSize length prefix.
    pub payload: Vec<u8>,
    /// The onion for the next hop, absent if we are the destination.
    pub next_onion: Option<Vec<u8>>,
}

/// Why an HTLC was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
    Undecodable,
    FinalHop,
    UnknownChannel,
    DirectoryError,
    PeerDisconnected,
    ChannelInactive,
    SufficientCapacity,
    PeerUnsupported,
    NothingSpendable,
    RewriteFailed,
    AlreadySplit,
    AnnounceFailed,
}

impl std::fmt::Display for PassReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PassReason::Undecodable => "payload not decodable",
            PassReason::FinalHop => "we are the destination",
            PassReason::UnknownChannel => "next channel unknown",
            PassReason::DirectoryError => "channel lookup failed",
            PassReason::PeerDisconnected => "next peer disconnected",
            PassReason::ChannelInactive => "next channel not active",
            PassReason::SufficientCapacity => "enough spendable capacity",
            PassReason::PeerUnsupported => "peer does not support splits",
            PassReason::NothingSpendable => "nothing spendable",
            PassReason::RewriteFailed => "amount rewrite failed",
            PassReason::AlreadySplit => "split already in progress",
            PassReason::AnnounceFailed => "announce could not be sent",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug)]
pub enum Decision {
    /// Continued unmodified.
    PassThrough(PassReason),
    /// Handed to the aggregator as a leg of a split we receive.
    Aggregated(LegDecision),
    /// Forwarded with a reduced amount; the remainder is being routed.
    Split {
        forwarded_now: Msat,
        remaining: Msat,
        search: JoinHandle<SearchOutcome>,
    },
}

struct SplitPlan {
    payload: ForwardPayload,
    channel: PeerChannel,
    forwarded_now: Msat,
    remaining: Msat,
}

#[derive(Clone)]
pub struct Gatekeeper {
    ctx: SplitContext,
    aggregator: Aggregator,
    messaging: SplitMessaging,
}

impl Gatekeeper {
    pub fn new(ctx: SplitContext) -> Self {
        Self {
            aggregator: Aggregator::new(ctx.clone()),
            messaging: SplitMessaging::new(ctx.clone()),
            ctx,
        }
    }

    /// Handles one incoming HTLC. The continuation is always consumed.
    pub async fn on_htlc(&self, htlc: IncomingHtlc, continuation: Continuation) -> Decision {
        if self.ctx.store.role(&htlc.payment_hash).await == Some(Role::Receiver) {
            return Decision::Aggregated(self.aggregator.on_leg(htlc, continuation).await);
        }

        let plan = match self.plan(&htlc).await {
            Ok(plan) => plan,
            Err(reason) => {
                debug!(
                    "Htlc {} for {} passes through: {}",
                    htlc.leg, htlc.payment_hash, reason
                );
                continuation.resolve(HtlcResponse::Continue);
                return Decision::PassThrough(reason);
            }
        };

        self.start_split(htlc, plan, continuation).await
    }

    async fn plan(&self, htlc: &IncomingHtlc) -> Result<SplitPlan, PassReason> {
        let payload = ForwardPayload::decode(&htlc.payload).map_err(|e| {
            debug!("{}", SplitError::Decode(e));
            PassReason::Undecodable
        })?;
        let scid = payload.short_channel_id().ok_or(PassReason::FinalHop)?;

        let channel = match self.ctx.directory.get_channel(&scid).await {
            Ok(Some(channel)) => channel,
            Ok(None) => return Err(PassReason::UnknownChannel),
            Err(e) => {
                warn!("Looking up channel {} failed: {:#}", scid, e);
                return Err(PassReason::DirectoryError);
            }
        };
        if !channel.peer_connected {
            return Err(PassReason::PeerDisconnected);
        }
        if !channel.active {
            return Err(PassReason::ChannelInactive);
        }

        let requested = payload.amt_to_forward();
        if requested <= channel.spendable {
            return Err(PassReason::SufficientCapacity);
        }

        match self.ctx.directory.peer_supports_split(&channel.peer_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("{}: {}", channel.peer_id, SplitError::PeerUnsupported);
                return Err(PassReason::PeerUnsupported);
            }
            Err(e) => {
                warn!("Checking features of {} failed: {:#}", channel.peer_id, e);
                return Err(PassReason::PeerUnsupported);
            }
        }

        let forwarded_now = requested.min(channel.spendable);
        if forwarded_now.is_zero() {
            return Err(PassReason::NothingSpendable);
        }
        let remaining = requested
            .checked_sub(forwarded_now)
            .ok_or(PassReason::NothingSpendable)?;

        let payload = payload.with_amt_to_forward(forwarded_now).map_err(|e| {
            warn!("Cannot shrink amount of htlc {}: {}", htlc.leg, e);
            PassReason::RewriteFailed
        })?;

        info!(
            "Htlc {} for {}: {}, splitting",
            htlc.leg,
            htlc.payment_hash,
            SplitError::CapacityInsufficient {
                requested,
                spendable: channel.spendable,
            }
        );
        Ok(SplitPlan {
            payload,
            channel,
            forwarded_now,
            remaining,
        })
    }

    async fn start_split(
        &self,
        htlc: IncomingHtlc,
        plan: SplitPlan,
        continuation: Continuation,
    ) -> Decision {
        let payment_hash = htlc.payment_hash;
        let peer_id = plan.channel.peer_id;
        let constrained = Exclusion::new(plan.channel.short_channel_id, plan.channel.direction);

        let session = SplitSession::sender(
            payment_hash,
            peer_id,
            plan.remaining,
            [constrained],
            self.ctx.config.search_timeout,
        );
        let handle = match self.ctx.store.create(session).await {
            Ok(handle) => handle,
            Err(e) => {
                debug!("Not splitting htlc {}: {}", htlc.leg, e);
                continuation.resolve(HtlcResponse::Continue);
                return Decision::PassThrough(PassReason::AlreadySplit);
            }
        };

        if let Err(e) = self.messaging.announce(&peer_id, payment_hash).await {
            warn!("Not splitting {}: {:#}", payment_hash, e);
            self.ctx.store.remove(&payment_hash, &handle).await;
            continuation.resolve(HtlcResponse::Continue);
            return Decision::PassThrough(PassReason::AnnounceFailed);
        }

        continuation.resolve(HtlcResponse::ContinueWithPayload {
            payload: plan.payload.to_bytes(),
        });
        self.ctx
            .events
            .emit(SplitEvent::SplitStarted {
                payment_hash,
                peer_id,
                forwarded_now: plan.forwarded_now,
                remaining: plan.remaining,
            })
            .await;

        let finder = RouteFinder::new(self.ctx.clone());
        let search = tokio::spawn(async move { finder.run(handle).await });

        Decision::Split {
            forwarded_now: plan.forwarded_now,
            remaining: plan.remaining,
            search,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::core::split::message::SplitMessage;
    use crate::core::split::test_utils::*;
    use crate::core::tlv::{TlvEntry, TlvStream};
    use crate::proto::primitives::ShortChannelId;

    const NEXT: u64 = 0x0000_6700_0001_0001;

    fn hash() -> PaymentHash {
        PaymentHash([0x42; 32])
    }

    fn leg() -> LegId {
        LegId {
            in_channel: ShortChannelId::from(9u64),
            htlc_id: 0,
        }
    }

    fn payload(forward: u64, scid: Option<u64>) -> Vec<u8> {
        let mut entries = vec![
            TlvEntry {
                typ: 2,
                value: (forward as u32).to_be_bytes().to_vec(),
            },
            TlvEntry {
                typ: 4,
                value: 800_000u32.to_be_bytes().to_vec(),
            },
        ];
        if let Some(scid) = scid {
            entries.push(TlvEntry {
                typ: 6,
                value: scid.to_be_bytes().to_vec(),
            });
        }
        TlvStream(entries).to_length_prefixed()
    }

    fn htlc(forward: u64, scid: Option<u64>) -> IncomingHtlc {
        IncomingHtlc {
            leg: leg(),
            payment_hash: hash(),
            amount: Msat(forward + 1),
            cltv_expiry: 800_040,
            payload: payload(forward, scid),
            next_onion: Some(vec![0; 4]),
        }
    }

    fn harness(spendable: u64, split_peer: bool) -> Harness {
        let mut dir = MockDirectory::default().with_channel(channel(NEXT, node_b(), spendable));
        if split_peer {
            dir = dir.with_split_peer(node_b());
        }
        Harness::new(dir, MockPayments::default())
    }

    async fn run(h: &Harness, htlc: IncomingHtlc) -> (Decision, HtlcResponse) {
        let (c, rx) = Continuation::channel(htlc.leg);
        let d = Gatekeeper::new(h.ctx.clone()).on_htlc(htlc, c).await;
        (d, rx.await.unwrap())
    }

    #[tokio::test]
    async fn test_exact_capacity_passes_through() {
        let h = harness(50_000, true);
        let (d, resp) = run(&h, htlc(50_000, Some(NEXT))).await;
        assert!(matches!(
            d,
            Decision::PassThrough(PassReason::SufficientCapacity)
        ));
        assert_eq!(resp, HtlcResponse::Continue);
        assert!(h.sent_messages().is_empty());
        assert!(h.ctx.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_insufficient_capacity_splits() {
        let h = harness(20_000, true);
        let (d, resp) = run(&h, htlc(50_000, Some(NEXT))).await;
        let Decision::Split {
            forwarded_now,
            remaining,
            search,
        } = d
        else {
            panic!("expected split, got {:?}", d);
        };
        assert_eq!(forwarded_now, Msat(20_000));
        assert_eq!(remaining, Msat(30_000));

        let HtlcResponse::ContinueWithPayload { payload: rewritten } = resp else {
            panic!("expected rewritten payload");
        };
        let original = payload(50_000, Some(NEXT));
        // Bare stream, same size as the original without its length prefix.
        assert_eq!(rewritten.len(), original.len() - 1);
        let decoded = ForwardPayload::from_stream(TlvStream::from_bytes(&rewritten).unwrap()).unwrap();
        assert_eq!(decoded.amt_to_forward(), Msat(20_000));

        assert_eq!(
            h.sent_messages(),
            vec![(node_b(), SplitMessage::Announce(hash()).encode())]
        );

        // No scripted route, so the search fails.
        assert!(matches!(search.await.unwrap(), SearchOutcome::Failed(_)));
        let calls = h.payments.find_calls.lock().unwrap().clone();
        assert_eq!(calls[0].0, node_b());
        assert_eq!(calls[0].1, Msat(30_000));
        assert_eq!(
            calls[0].2,
            vec![Exclusion::new(ShortChannelId::from(NEXT), 0)]
        );
    }

    #[tokio::test]
    async fn test_pass_through_reasons() {
        let h = harness(20_000, false);
        let (d, _) = run(&h, htlc(50_000, Some(NEXT))).await;
        assert!(matches!(d, Decision::PassThrough(PassReason::PeerUnsupported)));

        let (d, _) = run(&h, htlc(50_000, None)).await;
        assert!(matches!(d, Decision::PassThrough(PassReason::FinalHop)));

        let (d, _) = run(&h, htlc(50_000, Some(77))).await;
        assert!(matches!(d, Decision::PassThrough(PassReason::UnknownChannel)));

        let mut bad = htlc(50_000, Some(NEXT));
        bad.payload = vec![0x05, 0x02, 0x01];
        let (d, resp) = run(&h, bad).await;
        assert!(matches!(d, Decision::PassThrough(PassReason::Undecodable)));
        assert_eq!(resp, HtlcResponse::Continue);
    }

    #[tokio::test]
    async fn test_disconnected_and_empty_channels_pass_through() {
        let mut down = channel(NEXT, node_b(), 20_000);
        down.peer_connected = false;
        let h = Harness::new(
            MockDirectory::default().with_channel(down).with_split_peer(node_b()),
            MockPayments::default(),
        );
        let (d, _) = run(&h, htlc(50_000, Some(NEXT))).await;
        assert!(matches!(d, Decision::PassThrough(PassReason::PeerDisconnected)));

        let h = harness(0, true);
        let (d, _) = run(&h, htlc(50_000, Some(NEXT))).await;
        assert!(matches!(d, Decision::PassThrough(PassReason::NothingSpendable)));
    }

    #[tokio::test]
    async fn test_announce_failure_passes_through() {
        let h = harness(20_000, true);
        h.messenger.fail.store(true, Ordering::SeqCst);
        let (d, resp) = run(&h, htlc(50_000, Some(NEXT))).await;
        assert!(matches!(d, Decision::PassThrough(PassReason::AnnounceFailed)));
        assert_eq!(resp, HtlcResponse::Continue);
        assert!(h.ctx.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_receiver_session_routes_to_aggregator() {
        let h = harness(1_000_000, true);
        h.ctx
            .store
            .create(SplitSession::receiver(hash(), node_a()))
            .await
            .unwrap();
        let (c, _rx) = Continuation::channel(leg());
        let d = Gatekeeper::new(h.ctx.clone())
            .on_htlc(htlc(10_000, None), c)
            .await;
        assert!(matches!(d, Decision::Aggregated(LegDecision::Held)));
    }
}
