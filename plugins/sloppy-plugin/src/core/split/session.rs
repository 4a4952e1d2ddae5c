//! Split Session State Machine
//!
//! A `SplitSession` tracks one payment hash that is being relayed in more
//! than one leg. The sender side (the node short on outbound capacity)
//! creates it when it decides to split; the receiver side (the next hop)
//! creates it on `SPLIT_ANNOUNCE`. The session itself does no I/O.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use super::continuation::{Continuation, HtlcResponse, LegId};
use crate::proto::primitives::{Msat, PaymentHash, PublicKey, ShortChannelId};

// ============================================================================
// Core Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// We reduced an HTLC and relay the remainder over an alternate route.
    Sender,
    /// We collect the legs and forward the reassembled amount.
    Receiver,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Sender => write!(f, "sender"),
            Role::Receiver => write!(f, "receiver"),
        }
    }
}

/// Lifecycle of a session. Transitions only move forward and the two
/// terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SplitState {
    Announced,
    Collecting,
    Forwarding,
    Resolved,
    Failed,
}

impl SplitState {
    fn rank(self) -> u8 {
        match self {
            SplitState::Announced => 0,
            SplitState::Collecting => 1,
            SplitState::Forwarding => 2,
            SplitState::Resolved | SplitState::Failed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SplitState::Resolved | SplitState::Failed)
    }
}

impl std::fmt::Display for SplitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SplitState::Announced => write!(f, "announced"),
            SplitState::Collecting => write!(f, "collecting"),
            SplitState::Forwarding => write!(f, "forwarding"),
            SplitState::Resolved => write!(f, "resolved"),
            SplitState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from} -> {to}")]
pub struct TransitionError {
    pub from: SplitState,
    pub to: SplitState,
}

/// A channel in one direction, pruned from route search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Exclusion {
    pub short_channel_id: ShortChannelId,
    pub direction: u8,
}

impl Exclusion {
    pub fn new(short_channel_id: ShortChannelId, direction: u8) -> Self {
        Self {
            short_channel_id,
            direction,
        }
    }
}

/// Formats as `lightningd` expects in `getroute`'s `exclude` list.
impl std::fmt::Display for Exclusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.short_channel_id, self.direction)
    }
}

/// Relay metadata carried by the main leg: what the receiver has to send
/// onward once all legs are in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardOnion {
    pub forward_amount: Msat,
    pub outgoing_cltv: u32,
    pub next_onion: Vec<u8>,
    pub short_channel_id: ShortChannelId,
}

#[derive(Debug)]
struct MainLeg {
    id: LegId,
    continuation: Continuation,
}

/// Result of offering a leg to a session.
#[derive(Debug)]
pub enum LegOutcome {
    /// The leg was counted and its continuation is held.
    Held,
    /// The leg was already counted; its continuation replaced the old one.
    Replayed,
    /// The session cannot take the leg. The continuation is handed back so
    /// the caller can answer it.
    Rejected(Continuation, RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Terminal,
    WrongRole,
    SecondMainLeg,
    AmountOverflow,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Terminal => write!(f, "session already terminated"),
            RejectReason::WrongRole => write!(f, "session is not collecting legs"),
            RejectReason::SecondMainLeg => write!(f, "a main leg was already received"),
            RejectReason::AmountOverflow => write!(f, "received amount overflows"),
        }
    }
}

/// All continuations a session still holds, taken out for resolution.
#[derive(Debug, Default)]
pub struct HeldContinuations {
    pub main: Option<Continuation>,
    pub additional: Vec<Continuation>,
}

impl HeldContinuations {
    pub fn len(&self) -> usize {
        self.additional.len() + usize::from(self.main.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Answers every held HTLC with the same response.
    pub fn resolve_all(self, response: HtlcResponse) -> usize {
        let mut count = 0;
        for c in self.main.into_iter().chain(self.additional) {
            c.resolve(response.clone());
            count += 1;
        }
        count
    }
}

// ============================================================================
// Session Event
// ============================================================================

/// Events emitted for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitEvent {
    SplitStarted {
        payment_hash: PaymentHash,
        peer_id: PublicKey,
        forwarded_now: Msat,
        remaining: Msat,
    },
    AnnounceReceived {
        payment_hash: PaymentHash,
        peer_id: PublicKey,
        duplicate: bool,
    },
    LegReceived {
        payment_hash: PaymentHash,
        leg: LegId,
        amount: Msat,
        main: bool,
        total_received: Msat,
        total_expected: Option<Msat>,
    },
    ForwardTriggered {
        payment_hash: PaymentHash,
        forward_amount: Msat,
        legs: usize,
    },
    AlternateAttemptFailed {
        payment_hash: PaymentHash,
        attempt: u32,
        excluded: Option<Exclusion>,
        reason: String,
    },
    SessionResolved {
        payment_hash: PaymentHash,
        role: Role,
        duration_ms: u64,
    },
    SessionFailed {
        payment_hash: PaymentHash,
        role: Role,
        phase: SplitState,
        reason: String,
        duration_ms: u64,
    },
    RaceIgnored {
        payment_hash: PaymentHash,
        what: String,
    },
}

// ============================================================================
// Session Struct
// ============================================================================

#[derive(Debug)]
pub struct SplitSession {
    payment_hash: PaymentHash,
    role: Role,
    peer_id: PublicKey,
    state: SplitState,
    total_expected: Option<Msat>,
    total_received: Msat,
    main: Option<MainLeg>,
    onion: Option<ForwardOnion>,
    additional: HashMap<LegId, Continuation>,
    counted: HashSet<LegId>,
    remaining: Msat,
    exclusions: HashSet<Exclusion>,
    deadline: Option<Instant>,
    created_at: Instant,
}

impl SplitSession {
    /// A session for an HTLC we reduced; `remaining` still has to reach
    /// `peer_id` over another route before `deadline`.
    pub fn sender(
        payment_hash: PaymentHash,
        peer_id: PublicKey,
        remaining: Msat,
        exclusions: impl IntoIterator<Item = Exclusion>,
        search_budget: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            remaining,
            exclusions: exclusions.into_iter().collect(),
            deadline: Some(now + search_budget),
            ..Self::empty(payment_hash, Role::Sender, peer_id, now)
        }
    }

    /// A session announced to us by `peer_id`.
    pub fn receiver(payment_hash: PaymentHash, peer_id: PublicKey) -> Self {
        Self::empty(payment_hash, Role::Receiver, peer_id, Instant::now())
    }

    fn empty(payment_hash: PaymentHash, role: Role, peer_id: PublicKey, now: Instant) -> Self {
        Self {
            payment_hash,
            role,
            peer_id,
            state: SplitState::Announced,
            total_expected: None,
            total_received: Msat::ZERO,
            main: None,
            onion: None,
            additional: HashMap::new(),
            counted: HashSet::new(),
            remaining: Msat::ZERO,
            exclusions: HashSet::new(),
            deadline: None,
            created_at: now,
        }
    }

    pub fn payment_hash(&self) -> PaymentHash {
        self.payment_hash
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_id(&self) -> PublicKey {
        self.peer_id
    }

    pub fn state(&self) -> SplitState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn total_expected(&self) -> Option<Msat> {
        self.total_expected
    }

    pub fn total_received(&self) -> Msat {
        self.total_received
    }

    pub fn onion(&self) -> Option<&ForwardOnion> {
        self.onion.as_ref()
    }

    pub fn has_main_leg(&self) -> bool {
        self.main.is_some()
    }

    pub fn additional_count(&self) -> usize {
        self.additional.len()
    }

    pub fn remaining(&self) -> Msat {
        self.remaining
    }

    pub fn exclusions(&self) -> Vec<Exclusion> {
        self.exclusions.iter().copied().collect()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn duration_ms(&self) -> u64 {
        self.created_at.elapsed().as_millis() as u64
    }

    /// True once the main leg announced what is owed and the legs cover it.
    pub fn expectation_met(&self) -> bool {
        self.total_expected
            .is_some_and(|expected| self.total_received >= expected)
    }

    /// Moves to `next`. Backward moves and leaving a terminal state are
    /// refused; moving to the current state is a no-op.
    pub fn advance(&mut self, next: SplitState) -> Result<(), TransitionError> {
        if next == self.state {
            return Ok(());
        }
        if self.state.is_terminal() || next.rank() <= self.state.rank() {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Adds `exclusion` to the search exclusions. Returns false if it was
    /// already excluded.
    pub fn exclude(&mut self, exclusion: Exclusion) -> bool {
        self.exclusions.insert(exclusion)
    }

    /// Records the leg that carries the relay metadata. `total_expected` is
    /// the forward amount plus our fee for the onward channel.
    pub fn record_main(
        &mut self,
        leg: LegId,
        amount: Msat,
        onion: ForwardOnion,
        total_expected: Msat,
        continuation: Continuation,
    ) -> LegOutcome {
        if let Some(rejected) = self.check_accepts() {
            return LegOutcome::Rejected(continuation, rejected);
        }
        if let Some(main) = self.main.as_mut() {
            if main.id == leg {
                let stale = std::mem::replace(&mut main.continuation, continuation);
                stale.resolve(HtlcResponse::temporary_failure());
                return LegOutcome::Replayed;
            }
            return LegOutcome::Rejected(continuation, RejectReason::SecondMainLeg);
        }
        if !self.count(leg, amount) {
            return LegOutcome::Rejected(continuation, RejectReason::AmountOverflow);
        }
        self.total_expected = Some(total_expected);
        self.onion = Some(onion);
        self.main = Some(MainLeg {
            id: leg,
            continuation,
        });
        LegOutcome::Held
    }

    /// Records a leg without relay metadata. These legs are fungible.
    pub fn record_additional(
        &mut self,
        leg: LegId,
        amount: Msat,
        continuation: Continuation,
    ) -> LegOutcome {
        if let Some(rejected) = self.check_accepts() {
            return LegOutcome::Rejected(continuation, rejected);
        }
        if let Some(stale) = self.additional.get_mut(&leg) {
            let stale = std::mem::replace(stale, continuation);
            stale.resolve(HtlcResponse::temporary_failure());
            return LegOutcome::Replayed;
        }
        if !self.count(leg, amount) {
            return LegOutcome::Rejected(continuation, RejectReason::AmountOverflow);
        }
        self.additional.insert(leg, continuation);
        LegOutcome::Held
    }

    fn check_accepts(&self) -> Option<RejectReason> {
        if self.is_terminal() {
            Some(RejectReason::Terminal)
        } else if self.role != Role::Receiver {
            Some(RejectReason::WrongRole)
        } else {
            None
        }
    }

    fn count(&mut self, leg: LegId, amount: Msat) -> bool {
        let Some(total) = self.total_received.checked_add(amount) else {
            return false;
        };
        if !self.counted.insert(leg) {
            return true;
        }
        self.total_received = total;
        if self.state == SplitState::Announced {
            self.state = SplitState::Collecting;
        }
        true
    }

    /// If all legs are in and no forward was issued yet, moves to
    /// `Forwarding` and returns what to forward. Returns `None` otherwise,
    /// so the forward is issued at most once.
    pub fn take_forward(&mut self) -> Option<ForwardOnion> {
        if !self.expectation_met() || self.state.rank() >= SplitState::Forwarding.rank() {
            return None;
        }
        let onion = self.onion.clone()?;
        self.state = SplitState::Forwarding;
        Some(onion)
    }

    /// Takes every held continuation out of the session.
    pub fn take_continuations(&mut self) -> HeldContinuations {
        HeldContinuations {
            main: self.main.take().map(|m| m.continuation),
            additional: self.additional.drain().map(|(_, c)| c).collect(),
        }
    }

    /// Moves to a terminal state and hands out whatever is still held.
    /// Returns `None` if the session already terminated.
    pub fn terminate(&mut self, outcome: SplitState) -> Option<HeldContinuations> {
        debug_assert!(outcome.is_terminal());
        self.advance(outcome).ok()?;
        Some(self.take_continuations())
    }
}

// ============================================================================
// Tests
// ============================================================================
