//! Partial Payment Aggregator
//!
//! Collects the legs of a split payment on the receiver side. The leg that
//! still carries relay metadata is the main leg; it tells us what the next
//! hop is owed. Every other leg is an amount. Once the legs cover the
//! forward amount plus our fee, the main leg's onion is sent onward exactly
//! once and every held leg is resolved with the outcome.

use log::{debug, info, warn};
use tokio::task::JoinHandle;

use super::continuation::{Continuation, HtlcResponse};
use super::error::SplitError;
use super::gatekeeper::IncomingHtlc;
use super::provider::{FirstHop, PaymentOutcome};
use super::session::{ForwardOnion, LegOutcome, RejectReason, SplitEvent, SplitState};
use super::store::SessionHandle;
use super::SplitContext;
use crate::core::onion::ForwardPayload;
use crate::proto::primitives::{Msat, PaymentHash, Preimage};

/// What happened to a leg handed to the aggregator.
#[derive(Debug)]
pub enum LegDecision {
    /// Counted and held.
    Held,
    /// Already counted; the new continuation replaces the stale one.
    Replayed,
    /// This leg completed the payment. The handle finishes once every leg
    /// has been resolved.
    ForwardStarted(JoinHandle<()>),
    /// The session could not take the leg; it was failed.
    Rejected(RejectReason),
    /// The session vanished before the leg arrived; it was continued.
    NoSession,
    /// The main leg could not be used, so the whole session was failed.
    SessionFailed,
}

enum ForwardResult {
    Settled(Preimage),
    Failed { main: HtlcResponse, reason: String },
}

#[derive(Clone)]
pub struct Aggregator {
    ctx: SplitContext,
}

impl Aggregator {
    pub fn new(ctx: SplitContext) -> Self {
        Self { ctx }
    }

    /// Adds a leg to the receiver session for its payment hash.
    ///
    /// The continuation is always consumed: held by the session, or
    /// resolved right away.
    pub async fn on_leg(&self, htlc: IncomingHtlc, continuation: Continuation) -> LegDecision {
        let payment_hash = htlc.payment_hash;
        let Some(handle) = self.ctx.store.get(&payment_hash).await else {
            debug!(
                "No split session for {} anymore, continuing htlc {}",
                payment_hash, htlc.leg
            );
            continuation.resolve(HtlcResponse::Continue);
            return LegDecision::NoSession;
        };

        // Channel lookup happens before the session is locked.
        let main = match self.main_leg_terms(&htlc).await {
            Ok(main) => main,
            Err(e) => {
                warn!(
                    "Main leg {} for {} is unusable: {}",
                    htlc.leg, payment_hash, e
                );
                continuation.resolve(HtlcResponse::temporary_failure());
                self.fail_session(&handle, payment_hash, e.to_string()).await;
                return LegDecision::SessionFailed;
            }
        };
        let is_main = main.is_some();

        let mut session = handle.lock().await;
        let outcome = match main {
            Some((onion, expected)) => {
                session.record_main(htlc.leg, htlc.amount, onion, expected, continuation)
            }
            None => session.record_additional(htlc.leg, htlc.amount, continuation),
        };
        match outcome {
            LegOutcome::Held => {}
            LegOutcome::Replayed => {
                debug!("Htlc {} for {} replayed", htlc.leg, payment_hash);
                return LegDecision::Replayed;
            }
            LegOutcome::Rejected(continuation, reason) => {
                drop(session);
                warn!(
                    "Rejecting htlc {} for {}: {}",
                    htlc.leg, payment_hash, reason
                );
                continuation.resolve(HtlcResponse::temporary_failure());
                return LegDecision::Rejected(reason);
            }
        }

        let received = SplitEvent::LegReceived {
            payment_hash,
            leg: htlc.leg,
            amount: htlc.amount,
            main: is_main,
            total_received: session.total_received(),
            total_expected: session.total_expected(),
        };
        debug!(
            "Leg {} for {}: received {} of {:?}",
            htlc.leg,
            payment_hash,
            session.total_received(),
            session.total_expected()
        );
        let legs = session.additional_count() + usize::from(session.has_main_leg());
        let forward = session.take_forward();
        drop(session);

        self.ctx.events.emit(received).await;

        let Some(onion) = forward else {
            return LegDecision::Held;
        };
        info!(
            "All {} legs for {} are in, forwarding {} over {}",
            legs, payment_hash, onion.forward_amount, onion.short_channel_id
        );
        self.ctx
            .events
            .emit(SplitEvent::ForwardTriggered {
                payment_hash,
                forward_amount: onion.forward_amount,
                legs,
            })
            .await;

        let this = self.clone();
        LegDecision::ForwardStarted(tokio::spawn(async move {
            this.forward(handle, payment_hash, onion).await
        }))
    }

    /// For a leg with a next hop: the relay metadata and what the legs
    /// must add up to. `None` for legs without a next hop.
    async fn main_leg_terms(
        &self,
        htlc: &IncomingHtlc,
    ) -> Result<Option<(ForwardOnion, Msat)>, SplitError> {
        let payload = match ForwardPayload::decode(&htlc.payload) {
            Ok(p) => p,
            Err(e) => {
                debug!(
                    "Counting undecodable leg {} for {} as additional: {}",
                    htlc.leg, htlc.payment_hash, e
                );
                return Ok(None);
            }
        };
        let Some(scid) = payload.short_channel_id() else {
            return Ok(None);
        };
        let next_onion = htlc
            .next_onion
            .clone()
            .ok_or_else(|| SplitError::ForwardFailure("main leg has no next onion".into()))?;
        let channel = self
            .ctx
            .directory
            .get_channel(&scid)
            .await?
            .ok_or_else(|| SplitError::ForwardFailure(format!("no channel {}", scid)))?;

        let forward_amount = payload.amt_to_forward();
        let expected = channel
            .fee_policy
            .amount_with_fee(forward_amount)
            .ok_or_else(|| SplitError::ForwardFailure("fee overflows".into()))?;

        Ok(Some((
            ForwardOnion {
                forward_amount,
                outgoing_cltv: payload.outgoing_cltv(),
                next_onion,
                short_channel_id: scid,
            },
            expected,
        )))
    }

    async fn fail_session(&self, handle: &SessionHandle, payment_hash: PaymentHash, reason: String) {
        let mut session = handle.lock().await;
        let phase = session.state();
        let Some(held) = session.terminate(SplitState::Failed) else {
            return;
        };
        let role = session.role();
        let duration_ms = session.duration_ms();
        drop(session);

        held.resolve_all(HtlcResponse::temporary_failure());
        self.ctx.store.remove(&payment_hash, handle).await;
        self.ctx
            .events
            .emit(SplitEvent::SessionFailed {
                payment_hash,
                role,
                phase,
                reason,
                duration_ms,
            })
            .await;
    }

    async fn forward(&self, handle: SessionHandle, payment_hash: PaymentHash, onion: ForwardOnion) {
        let result = self.send_onward(&payment_hash, &onion).await;

        let mut session = handle.lock().await;
        let phase = session.state();
        let outcome = match result {
            ForwardResult::Settled(_) => SplitState::Resolved,
            ForwardResult::Failed { .. } => SplitState::Failed,
        };
        let Some(held) = session.terminate(outcome) else {
            debug!(
                "Forward result for {} arrived after the session ended",
                payment_hash
            );
            return;
        };
        let role = session.role();
        let duration_ms = session.duration_ms();
        drop(session);

        let event = match result {
            ForwardResult::Settled(preimage) => {
                let resolved = held.resolve_all(HtlcResponse::Resolve { preimage });
                info!("Resolved {} legs of {}", resolved, payment_hash);
                SplitEvent::SessionResolved {
                    payment_hash,
                    role,
                    duration_ms,
                }
            }
            ForwardResult::Failed { main, reason } => {
                info!("Forward of {} failed: {}", payment_hash, reason);
                if let Some(c) = held.main {
                    c.resolve(main);
                }
                for c in held.additional {
                    c.resolve(HtlcResponse::temporary_failure());
                }
                SplitEvent::SessionFailed {
                    payment_hash,
                    role,
                    phase,
                    reason,
                    duration_ms,
                }
            }
        };

        self.ctx.store.remove(&payment_hash, &handle).await;
        self.ctx.events.emit(event).await;
    }

    async fn send_onward(&self, payment_hash: &PaymentHash, onion: &ForwardOnion) -> ForwardResult {
        let fail = |reason: String| ForwardResult::Failed {
            main: HtlcResponse::temporary_failure(),
            reason,
        };

        let peer_id = match self.ctx.directory.get_channel(&onion.short_channel_id).await {
            Ok(Some(channel)) => channel.peer_id,
            Ok(None) => return fail(format!("channel {} is gone", onion.short_channel_id)),
            Err(e) => return fail(format!("{:#}", e)),
        };
        let first_hop = FirstHop {
            id: peer_id,
            amount: onion.forward_amount,
            delay: onion.outgoing_cltv,
        };

        if let Err(e) = self
            .ctx
            .payments
            .send_onion(&first_hop, &onion.next_onion, payment_hash)
            .await
        {
            return fail(format!("sendonion failed: {:#}", e));
        }

        match self.ctx.payments.await_outcome(payment_hash).await {
            Ok(PaymentOutcome::Settled(preimage)) if preimage.matches(payment_hash) => {
                ForwardResult::Settled(preimage)
            }
            Ok(PaymentOutcome::Settled(preimage)) => {
                fail(format!("preimage {} does not match", preimage))
            }
            Ok(PaymentOutcome::Failed(detail)) => match detail.onion_reply {
                Some(onion_reply) => ForwardResult::Failed {
                    main: HtlcResponse::FailWithOnion { onion_reply },
                    reason: detail.message,
                },
                None => fail(detail.message),
            },
            Err(e) => fail(format!("waiting for forward failed: {:#}", e)),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::split::continuation::LegId;
    use crate::core::split::provider::FailureDetail;
    use crate::core::split::session::{Role, SplitSession};
    use crate::core::split::test_utils::*;
    use crate::core::tlv::{TlvEntry, TlvStream};
    use crate::proto::primitives::{FeePolicy, Ppm, ShortChannelId};

    const NEXT_SCID: u64 = 500;

    fn preimage() -> Preimage {
        Preimage([7u8; 32])
    }

    fn hash() -> PaymentHash {
        preimage().payment_hash()
    }

    fn leg(id: u64) -> LegId {
        LegId {
            in_channel: ShortChannelId::from(100u64),
            htlc_id: id,
        }
    }

    fn payload(forward: u64, scid: Option<u64>) -> Vec<u8> {
        let mut entries = vec![
            TlvEntry {
                typ: 2,
                value: forward.to_be_bytes().iter().copied().skip_while(|b| *b == 0).collect(),
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

    fn main_leg(id: u64, amount: u64, forward: u64) -> IncomingHtlc {
        IncomingHtlc {
            leg: leg(id),
            payment_hash: hash(),
            amount: Msat(amount),
            cltv_expiry: 800_040,
            payload: payload(forward, Some(NEXT_SCID)),
            next_onion: Some(vec![0xaa; 8]),
        }
    }

    fn extra_leg(id: u64, amount: u64) -> IncomingHtlc {
        IncomingHtlc {
            leg: leg(id),
            payment_hash: hash(),
            amount: Msat(amount),
            cltv_expiry: 800_040,
            payload: payload(amount, None),
            next_onion: None,
        }
    }

    fn directory() -> MockDirectory {
        let mut next = channel(NEXT_SCID, node_c(), 1_000_000);
        next.fee_policy = FeePolicy::new(Msat(1), Ppm(0));
        MockDirectory::default().with_channel(next)
    }

    async fn harness(payments: MockPayments) -> Harness {
        let h = Harness::new(directory(), payments);
        h.ctx
            .store
            .create(SplitSession::receiver(hash(), node_a()))
            .await
            .unwrap();
        h
    }

    #[tokio::test]
    async fn test_main_then_additional_forwards_once() {
        let h = harness(MockPayments::default().with_outcome(PaymentOutcome::Settled(preimage()))).await;
        let agg = Aggregator::new(h.ctx.clone());

        let (c1, rx1) = Continuation::channel(leg(1));
        let d = agg.on_leg(main_leg(1, 20_000, 30_000), c1).await;
        assert!(matches!(d, LegDecision::Held));
        {
            let handle = h.ctx.store.get(&hash()).await.unwrap();
            let s = handle.lock().await;
            assert_eq!(s.total_expected(), Some(Msat(30_001)));
            assert_eq!(s.total_received(), Msat(20_000));
        }

        let (c2, rx2) = Continuation::channel(leg(2));
        let LegDecision::ForwardStarted(task) = agg.on_leg(extra_leg(2, 30_000), c2).await else {
            panic!("expected forward");
        };
        task.await.unwrap();

        assert_eq!(rx1.await.unwrap(), HtlcResponse::Resolve { preimage: preimage() });
        assert_eq!(rx2.await.unwrap(), HtlcResponse::Resolve { preimage: preimage() });

        let onions = h.payments.sent_onions.lock().unwrap().clone();
        assert_eq!(onions.len(), 1);
        let (first_hop, onion, ph) = &onions[0];
        assert_eq!(first_hop.id, node_c());
        assert_eq!(first_hop.amount, Msat(30_000));
        assert_eq!(first_hop.delay, 800_000);
        assert_eq!(onion, &vec![0xaa; 8]);
        assert_eq!(*ph, hash());

        assert!(h.ctx.store.get(&hash()).await.is_none());
        assert!(h.events().iter().any(|e| matches!(
            e,
            SplitEvent::SessionResolved { role: Role::Receiver, .. }
        )));
    }

    #[tokio::test]
    async fn test_forward_failure_relays_onion_to_main_only() {
        let detail = FailureDetail {
            onion_reply: Some(vec![0xde, 0xad]),
            message: "WIRE_TEMPORARY_CHANNEL_FAILURE".into(),
            ..Default::default()
        };
        let h = harness(MockPayments::default().with_outcome(PaymentOutcome::Failed(detail))).await;
        let agg = Aggregator::new(h.ctx.clone());

        let (c1, rx1) = Continuation::channel(leg(1));
        agg.on_leg(extra_leg(1, 30_000), c1).await;
        let (c2, rx2) = Continuation::channel(leg(2));
        let LegDecision::ForwardStarted(task) = agg.on_leg(main_leg(2, 20_000, 30_000), c2).await
        else {
            panic!("expected forward");
        };
        task.await.unwrap();

        assert_eq!(
            rx2.await.unwrap(),
            HtlcResponse::FailWithOnion {
                onion_reply: vec![0xde, 0xad]
            }
        );
        assert_eq!(rx1.await.unwrap(), HtlcResponse::temporary_failure());
        assert!(h.ctx.store.get(&hash()).await.is_none());
    }

    #[tokio::test]
    async fn test_wrong_preimage_fails_all_legs() {
        let h = harness(
            MockPayments::default().with_outcome(PaymentOutcome::Settled(Preimage([8u8; 32]))),
        )
        .await;
        let agg = Aggregator::new(h.ctx.clone());

        let (c1, rx1) = Continuation::channel(leg(1));
        let LegDecision::ForwardStarted(task) = agg.on_leg(main_leg(1, 30_001, 30_000), c1).await
        else {
            panic!("expected forward");
        };
        task.await.unwrap();
        assert_eq!(rx1.await.unwrap(), HtlcResponse::temporary_failure());
    }

    #[tokio::test]
    async fn test_replayed_leg_not_counted_twice() {
        let h = harness(MockPayments::default()).await;
        let agg = Aggregator::new(h.ctx.clone());

        let (c1, _rx1) = Continuation::channel(leg(1));
        agg.on_leg(extra_leg(1, 10_000), c1).await;
        let (c1b, _rx1b) = Continuation::channel(leg(1));
        assert!(matches!(
            agg.on_leg(extra_leg(1, 10_000), c1b).await,
            LegDecision::Replayed
        ));

        let handle = h.ctx.store.get(&hash()).await.unwrap();
        assert_eq!(handle.lock().await.total_received(), Msat(10_000));
    }

    #[tokio::test]
    async fn test_unknown_next_channel_fails_session() {
        let h = Harness::new(MockDirectory::default(), MockPayments::default());
        h.ctx
            .store
            .create(SplitSession::receiver(hash(), node_a()))
            .await
            .unwrap();
        let agg = Aggregator::new(h.ctx.clone());

        let (c1, rx1) = Continuation::channel(leg(1));
        agg.on_leg(extra_leg(1, 10_000), c1).await;
        let (c2, rx2) = Continuation::channel(leg(2));
        assert!(matches!(
            agg.on_leg(main_leg(2, 20_000, 30_000), c2).await,
            LegDecision::SessionFailed
        ));
        assert_eq!(rx1.await.unwrap(), HtlcResponse::temporary_failure());
        assert_eq!(rx2.await.unwrap(), HtlcResponse::temporary_failure());
        assert!(h.ctx.store.get(&hash()).await.is_none());
    }

    #[tokio::test]
    async fn test_leg_without_session_continues() {
        let h = Harness::new(directory(), MockPayments::default());
        let agg = Aggregator::new(h.ctx.clone());
        let (c, rx) = Continuation::channel(leg(1));
        assert!(matches!(
            agg.on_leg(extra_leg(1, 1), c).await,
            LegDecision::NoSession
        ));
        assert_eq!(rx.await.unwrap(), HtlcResponse::Continue);
    }
}
