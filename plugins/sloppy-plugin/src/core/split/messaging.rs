//! Split Announcer / Receiver
//!
//! Sends and handles the two split messages. Handling is idempotent: a
//! repeated `SPLIT_ANNOUNCE` finds the existing session, and a `SPLIT_FAIL`
//! that loses the race against a completed aggregation is dropped.

use anyhow::{Context, Result};
use log::{debug, info, warn};

use super::continuation::HtlcResponse;
use super::message::SplitMessage;
use super::session::{Role, SplitEvent, SplitSession, SplitState};
use super::SplitContext;
use crate::proto::primitives::{PaymentHash, PublicKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Not one of our messages.
    NotSplit,
    SessionCreated,
    DuplicateAnnounce,
    /// The announced split was abandoned and the held legs were failed.
    SessionFailed { failed_legs: usize },
    /// The message lost a race or does not match a session.
    Ignored(String),
}

#[derive(Clone)]
pub struct SplitMessaging {
    ctx: SplitContext,
}

impl SplitMessaging {
    pub fn new(ctx: SplitContext) -> Self {
        Self { ctx }
    }

    pub async fn announce(&self, peer_id: &PublicKey, payment_hash: PaymentHash) -> Result<()> {
        self.send(peer_id, SplitMessage::Announce(payment_hash)).await
    }

    pub async fn fail(&self, peer_id: &PublicKey, payment_hash: PaymentHash) -> Result<()> {
        self.send(peer_id, SplitMessage::Fail(payment_hash)).await
    }

    async fn send(&self, peer_id: &PublicKey, msg: SplitMessage) -> Result<()> {
        debug!("Sending {:?} to {}", msg, peer_id);
        self.ctx
            .messenger
            .send_custom_msg(peer_id, &msg.encode())
            .await
            .with_context(|| format!("sending split message type {} to {}", msg.type_code(), peer_id))
    }

    /// Handles a custom message received from `peer_id`.
    pub async fn on_message(&self, peer_id: PublicKey, raw: &[u8]) -> MessageOutcome {
        if !SplitMessage::is_split_message(raw) {
            return MessageOutcome::NotSplit;
        }
        match SplitMessage::decode(raw) {
            Ok(SplitMessage::Announce(hash)) => self.on_announce(peer_id, hash).await,
            Ok(SplitMessage::Fail(hash)) => self.on_fail(peer_id, hash).await,
            Err(e) => {
                warn!("Malformed split message from {}: {}", peer_id, e);
                MessageOutcome::Ignored(e.to_string())
            }
        }
    }

    async fn on_announce(&self, peer_id: PublicKey, payment_hash: PaymentHash) -> MessageOutcome {
        let (handle, created) = self
            .ctx
            .store
            .get_or_create(payment_hash, || SplitSession::receiver(payment_hash, peer_id))
            .await;

        if !created {
            let (role, owner) = {
                let s = handle.lock().await;
                (s.role(), s.peer_id())
            };
            if role != Role::Receiver || owner != peer_id {
                let what = format!("announce from {} for a {} session of {}", peer_id, role, owner);
                return self.ignore(payment_hash, what).await;
            }
        }

        if created {
            info!("{} announced a split of {}", peer_id, payment_hash);
        } else {
            debug!("Duplicate announce of {} from {}", payment_hash, peer_id);
        }
        self.ctx
            .events
            .emit(SplitEvent::AnnounceReceived {
                payment_hash,
                peer_id,
                duplicate: !created,
            })
            .await;

        if created {
            MessageOutcome::SessionCreated
        } else {
            MessageOutcome::DuplicateAnnounce
        }
    }

    async fn on_fail(&self, peer_id: PublicKey, payment_hash: PaymentHash) -> MessageOutcome {
        let Some(handle) = self.ctx.store.get(&payment_hash).await else {
            return self
                .ignore(payment_hash, "fail for unknown session".to_string())
                .await;
        };

        let mut session = handle.lock().await;
        if session.role() != Role::Receiver || session.peer_id() != peer_id {
            let what = format!(
                "fail from {} for a {} session of {}",
                peer_id,
                session.role(),
                session.peer_id()
            );
            drop(session);
            return self.ignore(payment_hash, what).await;
        }
        if session.expectation_met() || session.is_terminal() {
            let what = format!("fail after session reached {}", session.state());
            drop(session);
            return self.ignore(payment_hash, what).await;
        }

        let phase = session.state();
        let Some(held) = session.terminate(SplitState::Failed) else {
            drop(session);
            return self.ignore(payment_hash, "fail for terminated session".to_string()).await;
        };
        let duration_ms = session.duration_ms();
        drop(session);

        let failed_legs = held.resolve_all(HtlcResponse::temporary_failure());
        self.ctx.store.remove(&payment_hash, &handle).await;
        info!(
            "{} abandoned the split of {}, failed {} held legs",
            peer_id, payment_hash, failed_legs
        );
        self.ctx
            .events
            .emit(SplitEvent::SessionFailed {
                payment_hash,
                role: Role::Receiver,
                phase,
                reason: "peer sent split fail".to_string(),
                duration_ms,
            })
            .await;

        MessageOutcome::SessionFailed { failed_legs }
    }

    async fn ignore(&self, payment_hash: PaymentHash, what: String) -> MessageOutcome {
        debug!("Ignoring split message for {}: {}", payment_hash, what);
        self.ctx
            .events
            .emit(SplitEvent::RaceIgnored {
                payment_hash,
                what: what.clone(),
            })
            .await;
        MessageOutcome::Ignored(what)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::split::continuation::{Continuation, LegId};
    use crate::core::split::session::ForwardOnion;
    use crate::core::split::test_utils::*;
    use crate::proto::primitives::{Msat, ShortChannelId};

    fn hash() -> PaymentHash {
        PaymentHash([5; 32])
    }

    fn leg(id: u64) -> LegId {
        LegId {
            in_channel: ShortChannelId::from(1u64),
            htlc_id: id,
        }
    }

    fn harness() -> Harness {
        Harness::new(MockDirectory::default(), MockPayments::default())
    }

    #[tokio::test]
    async fn test_announce_sends_wire_message() {
        let h = harness();
        let m = SplitMessaging::new(h.ctx.clone());
        m.announce(&node_b(), hash()).await.unwrap();
        let sent = h.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, node_b());
        assert_eq!(sent[0].1, SplitMessage::Announce(hash()).encode());
    }

    #[tokio::test]
    async fn test_duplicate_announces_create_one_session() {
        let h = harness();
        let m = Arc::new(SplitMessaging::new(h.ctx.clone()));
        let raw = SplitMessage::Announce(hash()).encode();

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let m = m.clone();
            let raw = raw.clone();
            tasks.push(tokio::spawn(async move { m.on_message(node_a(), &raw).await }));
        }
        let mut created = 0;
        for t in tasks {
            match t.await.unwrap() {
                MessageOutcome::SessionCreated => created += 1,
                MessageOutcome::DuplicateAnnounce => {}
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(created, 1);
        assert_eq!(h.ctx.store.len().await, 1);
        assert_eq!(h.ctx.store.role(&hash()).await, Some(Role::Receiver));
    }

    #[tokio::test]
    async fn test_fail_releases_held_legs() {
        let h = harness();
        let m = SplitMessaging::new(h.ctx.clone());
        m.on_message(node_a(), &SplitMessage::Announce(hash()).encode())
            .await;

        let (c, rx) = Continuation::channel(leg(1));
        {
            let handle = h.ctx.store.get(&hash()).await.unwrap();
            let mut s = handle.lock().await;
            s.record_additional(leg(1), Msat(10_000), c);
        }

        let out = m
            .on_message(node_a(), &SplitMessage::Fail(hash()).encode())
            .await;
        assert_eq!(out, MessageOutcome::SessionFailed { failed_legs: 1 });
        assert_eq!(rx.await.unwrap(), HtlcResponse::temporary_failure());
        assert!(h.ctx.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_fail_from_other_peer_is_ignored() {
        let h = harness();
        let m = SplitMessaging::new(h.ctx.clone());
        m.on_message(node_a(), &SplitMessage::Announce(hash()).encode())
            .await;
        let out = m
            .on_message(node_b(), &SplitMessage::Fail(hash()).encode())
            .await;
        assert!(matches!(out, MessageOutcome::Ignored(_)));
        assert_eq!(h.ctx.store.len().await, 1);
    }

    #[tokio::test]
    async fn test_fail_after_expectation_met_is_ignored() {
        let h = harness();
        let m = SplitMessaging::new(h.ctx.clone());
        m.on_message(node_a(), &SplitMessage::Announce(hash()).encode())
            .await;

        let (c, _rx) = Continuation::channel(leg(1));
        {
            let handle = h.ctx.store.get(&hash()).await.unwrap();
            let mut s = handle.lock().await;
            let onion = ForwardOnion {
                forward_amount: Msat(100),
                outgoing_cltv: 10,
                next_onion: vec![],
                short_channel_id: ShortChannelId::from(2u64),
            };
            s.record_main(leg(1), Msat(101), onion, Msat(101), c);
            assert!(s.take_forward().is_some());
        }

        let out = m
            .on_message(node_a(), &SplitMessage::Fail(hash()).encode())
            .await;
        assert!(matches!(out, MessageOutcome::Ignored(_)));
        let handle = h.ctx.store.get(&hash()).await.unwrap();
        assert_eq!(handle.lock().await.state(), SplitState::Forwarding);
    }

    #[tokio::test]
    async fn test_fail_for_unknown_hash_is_ignored() {
        let h = harness();
        let m = SplitMessaging::new(h.ctx.clone());
        let out = m
            .on_message(node_a(), &SplitMessage::Fail(hash()).encode())
            .await;
        assert!(matches!(out, MessageOutcome::Ignored(_)));
        assert!(h
            .events()
            .iter()
            .any(|e| matches!(e, SplitEvent::RaceIgnored { .. })));
    }

    #[tokio::test]
    async fn test_foreign_message_is_not_split() {
        let h = harness();
        let m = SplitMessaging::new(h.ctx.clone());
        assert_eq!(
            m.on_message(node_a(), &[0x80, 0x01, 0x02]).await,
            MessageOutcome::NotSplit
        );
    }
}
