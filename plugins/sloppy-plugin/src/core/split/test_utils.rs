//! Mock collaborators shared by the unit tests of this module.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::Notify;

use super::provider::{
    ChannelDirectory, FailureDetail, FirstHop, PaymentOutcome, PaymentProvider, PeerChannel,
    PeerMessenger, RouteHop, SplitEventEmitter,
};
use super::session::{Exclusion, SplitEvent};
use super::{SplitConfig, SplitContext};
use crate::proto::primitives::{FeePolicy, Msat, PaymentHash, PublicKey, ShortChannelId};

pub fn node_a() -> PublicKey {
    "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798"
        .parse()
        .unwrap()
}

pub fn node_b() -> PublicKey {
    "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5"
        .parse()
        .unwrap()
}

pub fn node_c() -> PublicKey {
    "02f9308a019258c31049344f85f89d5229b531c845836f99b08601f113bce036f9"
        .parse()
        .unwrap()
}

pub fn channel(scid: u64, peer_id: PublicKey, spendable: u64) -> PeerChannel {
    PeerChannel {
        short_channel_id: ShortChannelId::from(scid),
        peer_id,
        peer_connected: true,
        active: true,
        spendable: Msat(spendable),
        direction: 0,
        fee_policy: FeePolicy::default(),
    }
}

// ============================================================================
// Directory
// ============================================================================

#[derive(Default)]
pub struct MockDirectory {
    channels: Mutex<HashMap<ShortChannelId, PeerChannel>>,
    split_peers: Mutex<HashSet<PublicKey>>,
}

impl MockDirectory {
    pub fn with_channel(self, channel: PeerChannel) -> Self {
        self.channels
            .lock()
            .unwrap()
            .insert(channel.short_channel_id, channel);
        self
    }

    pub fn with_split_peer(self, peer: PublicKey) -> Self {
        self.split_peers.lock().unwrap().insert(peer);
        self
    }
}

#[async_trait]
impl ChannelDirectory for MockDirectory {
    async fn get_channel(&self, scid: &ShortChannelId) -> Result<Option<PeerChannel>> {
        Ok(self.channels.lock().unwrap().get(scid).cloned())
    }

    async fn peer_supports_split(&self, peer_id: &PublicKey) -> Result<bool> {
        Ok(self.split_peers.lock().unwrap().contains(peer_id))
    }
}

// ============================================================================
// Payments
// ============================================================================

/// Hands out scripted routes and outcomes in order. Once the scripts run
/// out, no route is found and payments fail without detail.
#[derive(Default)]
pub struct MockPayments {
    routes: Mutex<VecDeque<Option<Vec<RouteHop>>>>,
    outcomes: Mutex<VecDeque<PaymentOutcome>>,
    pub find_calls: Mutex<Vec<(PublicKey, Msat, Vec<Exclusion>)>>,
    pub sent_routes: Mutex<Vec<(Vec<RouteHop>, PaymentHash)>>,
    pub sent_onions: Mutex<Vec<(FirstHop, Vec<u8>, PaymentHash)>>,
    /// When set, `await_outcome` waits for a notification first.
    pub outcome_gate: Option<Arc<Notify>>,
}

impl MockPayments {
    pub fn with_route(self, route: Vec<RouteHop>) -> Self {
        self.routes.lock().unwrap().push_back(Some(route));
        self
    }

    pub fn with_outcome(self, outcome: PaymentOutcome) -> Self {
        self.outcomes.lock().unwrap().push_back(outcome);
        self
    }

    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.outcome_gate = Some(gate);
        self
    }
}

#[async_trait]
impl PaymentProvider for MockPayments {
    async fn find_route(
        &self,
        destination: &PublicKey,
        amount: Msat,
        exclusions: &[Exclusion],
    ) -> Result<Option<Vec<RouteHop>>> {
        let mut sorted = exclusions.to_vec();
        sorted.sort_by_key(|e| e.to_string());
        self.find_calls
            .lock()
            .unwrap()
            .push((*destination, amount, sorted));
        Ok(self.routes.lock().unwrap().pop_front().flatten())
    }

    async fn send_route(&self, route: &[RouteHop], payment_hash: &PaymentHash) -> Result<()> {
        self.sent_routes
            .lock()
            .unwrap()
            .push((route.to_vec(), *payment_hash));
        Ok(())
    }

    async fn send_onion(
        &self,
        first_hop: &FirstHop,
        onion: &[u8],
        payment_hash: &PaymentHash,
    ) -> Result<()> {
        self.sent_onions
            .lock()
            .unwrap()
            .push((first_hop.clone(), onion.to_vec(), *payment_hash));
        Ok(())
    }

    async fn await_outcome(&self, _payment_hash: &PaymentHash) -> Result<PaymentOutcome> {
        if let Some(gate) = &self.outcome_gate {
            gate.notified().await;
        }
        Ok(self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                PaymentOutcome::Failed(FailureDetail {
                    message: "unscripted".to_string(),
                    ..Default::default()
                })
            }))
    }
}

// ============================================================================
// Messenger and Emitter
// ============================================================================

#[derive(Default)]
pub struct MockMessenger {
    pub sent: Mutex<Vec<(PublicKey, Vec<u8>)>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl PeerMessenger for MockMessenger {
    async fn send_custom_msg(&self, peer_id: &PublicKey, msg: &[u8]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("peer {} not connected", peer_id));
        }
        self.sent.lock().unwrap().push((*peer_id, msg.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
pub struct CapturingEmitter {
    pub events: Mutex<Vec<SplitEvent>>,
}

#[async_trait]
impl SplitEventEmitter for CapturingEmitter {
    async fn emit(&self, event: SplitEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub ctx: SplitContext,
    pub directory: Arc<MockDirectory>,
    pub payments: Arc<MockPayments>,
    pub messenger: Arc<MockMessenger>,
    pub emitter: Arc<CapturingEmitter>,
}

impl Harness {
    pub fn new(directory: MockDirectory, payments: MockPayments) -> Self {
        let directory = Arc::new(directory);
        let payments = Arc::new(payments);
        let messenger = Arc::new(MockMessenger::default());
        let emitter = Arc::new(CapturingEmitter::default());
        let ctx = SplitContext::new(
            directory.clone(),
            payments.clone(),
            messenger.clone(),
            emitter.clone(),
            SplitConfig::for_testing(),
        );
        Self {
            ctx,
            directory,
            payments,
            messenger,
            emitter,
        }
    }

    pub fn events(&self) -> Vec<SplitEvent> {
        self.emitter.events.lock().unwrap().clone()
    }

    pub fn sent_messages(&self) -> Vec<(PublicKey, Vec<u8>)> {
        self.messenger.sent.lock().unwrap().clone()
    }
}
