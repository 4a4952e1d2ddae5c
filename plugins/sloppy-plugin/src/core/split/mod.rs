//! Split forwarding.
//!
//! When the next channel cannot carry an HTLC in full, the sender side
//! forwards what fits, announces the split to the next hop and pays the
//! remainder over another route. The receiver side collects the legs and
//! forwards the reassembled amount once they cover what the next hop is
//! owed.

use std::sync::Arc;
use std::time::Duration;

pub mod aggregator;
pub mod continuation;
pub mod error;
pub mod gatekeeper;
pub mod message;
pub mod messaging;
pub mod provider;
pub mod route_finder;
pub mod session;
pub mod store;
pub mod timeouts;

use provider::{ChannelDirectory, PaymentProvider, PeerMessenger, SplitEventEmitter};
use store::SessionStore;

/// Feature bit advertised in `init`. Odd, so peers unaware of it ignore it.
pub const SPLIT_FEATURE_BIT: usize = 201;

/// Timing of the split components.
#[derive(Debug, Clone)]
pub struct SplitConfig {
    /// Wall-clock budget for the alternate route search.
    ///
    /// Default: 60 seconds
    pub search_timeout: Duration,

    /// Extra time a receiver waits for legs beyond the sender's search
    /// budget before it gives up.
    ///
    /// Default: 30 seconds
    pub receiver_grace: Duration,

    /// How often the receiver sessions are checked for expiry.
    ///
    /// Default: 1 second
    pub sweep_interval: Duration,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            search_timeout: Duration::from_secs(60),
            receiver_grace: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl SplitConfig {
    pub fn with_search_timeout(search_timeout: Duration) -> Self {
        Self {
            search_timeout,
            ..Self::default()
        }
    }

    /// How long a receiver session may wait for its legs.
    pub fn receiver_expiry(&self) -> Duration {
        self.search_timeout + self.receiver_grace
    }

    pub fn for_testing() -> Self {
        Self {
            search_timeout: Duration::from_millis(300),
            receiver_grace: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(10),
        }
    }
}

/// Everything the split components share. Cheap to clone.
#[derive(Clone)]
pub struct SplitContext {
    pub store: Arc<SessionStore>,
    pub directory: Arc<dyn ChannelDirectory>,
    pub payments: Arc<dyn PaymentProvider>,
    pub messenger: Arc<dyn PeerMessenger>,
    pub events: Arc<dyn SplitEventEmitter>,
    pub config: SplitConfig,
}

impl SplitContext {
    pub fn new(
        directory: Arc<dyn ChannelDirectory>,
        payments: Arc<dyn PaymentProvider>,
        messenger: Arc<dyn PeerMessenger>,
        events: Arc<dyn SplitEventEmitter>,
        config: SplitConfig,
    ) -> Self {
        Self {
            store: Arc::new(SessionStore::new()),
            directory,
            payments,
            messenger,
            events,
            config,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_utils;
