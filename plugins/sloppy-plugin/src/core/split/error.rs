use crate::core::onion::OnionError;
use crate::proto::primitives::{Msat, PaymentHash};

/// Outcomes the split components report. None of them is fatal to the
/// plugin; each one maps to a pass-through, a retry or a failed HTLC.
#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    #[error("failed to decode forward payload: {0}")]
    Decode(#[from] OnionError),
    #[error("requested {requested} but only {spendable} spendable")]
    CapacityInsufficient { requested: Msat, spendable: Msat },
    #[error("no route for {amount} found before the search ended")]
    RouteNotFound { amount: Msat },
    #[error("peer does not support split forwarding")]
    PeerUnsupported,
    #[error("onward forward failed: {0}")]
    ForwardFailure(String),
    #[error("ignored late event for {payment_hash}: {what}")]
    ProtocolRace {
        payment_hash: PaymentHash,
        what: String,
    },
    #[error("collaborator error: {0:#}")]
    Provider(#[from] anyhow::Error),
}
