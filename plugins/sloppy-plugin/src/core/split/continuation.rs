//! HTLC continuations.
//!
//! `lightningd` waits on the `htlc_accepted` hook until we answer, so every
//! incoming HTLC is represented by a `Continuation`: the sending half of a
//! oneshot channel whose receiver the hook handler awaits. Resolving consumes
//! the continuation, which makes answering twice impossible.

use tokio::sync::oneshot;

use crate::proto::primitives::{Preimage, ShortChannelId};

/// BOLT#4 failure code sent back upstream when we fail an HTLC ourselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FailureCode(pub u16);

impl FailureCode {
    const NODE: u16 = 0x2000;

    /// Generic transient failure. Carries no channel_update, so it can be
    /// sent for any leg.
    pub const TEMPORARY_NODE_FAILURE: FailureCode = FailureCode(Self::NODE | 2);

    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            FailureCode::TEMPORARY_NODE_FAILURE => write!(f, "temporary_node_failure"),
            FailureCode(code) => write!(f, "failure_code:{:#06x}", code),
        }
    }
}

/// Response to send back to the htlc_accepted hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HtlcResponse {
    /// Let `lightningd` process the HTLC as it normally would.
    Continue,
    /// Continue with a replacement hop payload (bare TLV stream).
    ContinueWithPayload { payload: Vec<u8> },
    /// Settle the HTLC with the preimage.
    Resolve { preimage: Preimage },
    /// Fail the HTLC with a failure code of our own.
    Fail { failure_code: FailureCode },
    /// Fail the HTLC with an onion reply received from downstream, which
    /// `lightningd` wraps before sending it upstream.
    FailWithOnion { onion_reply: Vec<u8> },
}

impl HtlcResponse {
    pub fn temporary_failure() -> Self {
        HtlcResponse::Fail {
            failure_code: FailureCode::TEMPORARY_NODE_FAILURE,
        }
    }
}

/// Identifies an incoming HTLC. `lightningd` replays `htlc_accepted` for
/// HTLCs still unresolved after a restart, with the same identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LegId {
    pub in_channel: ShortChannelId,
    pub htlc_id: u64,
}

impl std::fmt::Display for LegId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.in_channel, self.htlc_id)
    }
}

/// The pending answer to one `htlc_accepted` hook call.
pub struct Continuation {
    leg: LegId,
    responder: oneshot::Sender<HtlcResponse>,
}

impl Continuation {
    pub fn new(leg: LegId, responder: oneshot::Sender<HtlcResponse>) -> Self {
        Self { leg, responder }
    }

    /// Creates a continuation together with the receiver the hook handler
    /// waits on.
    pub fn channel(leg: LegId) -> (Self, oneshot::Receiver<HtlcResponse>) {
        let (tx, rx) = oneshot::channel();
        (Self::new(leg, tx), rx)
    }

    pub fn leg(&self) -> LegId {
        self.leg
    }

    /// Sends the response and consumes the continuation.
    ///
    /// Returns false if the hook side is gone (plugin shutting down or the
    /// hook call was cancelled); there is nobody left to answer then.
    pub fn resolve(self, response: HtlcResponse) -> bool {
        let leg = self.leg;
        match self.responder.send(response) {
            Ok(()) => true,
            Err(response) => {
                log::warn!(
                    "Hook for htlc {} went away before it could be answered with {:?}",
                    leg,
                    response
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Continuation")
            .field("leg", &self.leg)
            .field("responder", &"<oneshot::Sender>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leg(id: u64) -> LegId {
        LegId {
            in_channel: ShortChannelId::from(123u64),
            htlc_id: id,
        }
    }

    #[tokio::test]
    async fn test_resolve_delivers_response() {
        let (cont, rx) = Continuation::channel(leg(1));
        assert_eq!(cont.leg(), leg(1));
        assert!(cont.resolve(HtlcResponse::Continue));
        assert_eq!(rx.await.unwrap(), HtlcResponse::Continue);
    }

    #[tokio::test]
    async fn test_dropped_receiver() {
        let (cont, rx) = Continuation::channel(leg(2));
        drop(rx);
        // Must not panic.
        assert!(!cont.resolve(HtlcResponse::temporary_failure()));
    }

    #[tokio::test]
    async fn test_dropped_continuation_is_observable() {
        let (cont, rx) = Continuation::channel(leg(3));
        drop(cont);
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_failure_code() {
        assert_eq!(FailureCode::TEMPORARY_NODE_FAILURE.to_bytes(), [0x20, 0x02]);
        assert_eq!(
            FailureCode::TEMPORARY_NODE_FAILURE.to_string(),
            "temporary_node_failure"
        );
        assert_eq!(FailureCode(0x400f).to_string(), "failure_code:0x400f");
    }
}
