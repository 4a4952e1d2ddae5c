//! Alternate Route Finder
//!
//! Pays the part of a split HTLC that did not fit into the direct channel
//! to the split peer over some other route. Every attempt that fails at a
//! known half-channel excludes it from the next search. The search stops
//! on success, when no route is left, or when the deadline passes.

use std::time::Instant;

use log::{debug, info, warn};

use super::error::SplitError;
use super::messaging::SplitMessaging;
use super::provider::PaymentOutcome;
use super::session::{SplitEvent, SplitState};
use super::store::SessionHandle;
use super::SplitContext;
use crate::proto::primitives::{Msat, PaymentHash, PublicKey};

#[derive(Debug)]
pub enum SearchOutcome {
    /// The remainder arrived at the peer.
    Delivered { attempts: u32 },
    /// The search gave up and the peer was told.
    Failed(SplitError),
    /// The session ended some other way first; the result was dropped.
    Discarded,
}

struct Search {
    payment_hash: PaymentHash,
    peer_id: PublicKey,
    amount: Msat,
    deadline: Instant,
}

pub struct RouteFinder {
    ctx: SplitContext,
}

impl RouteFinder {
    pub fn new(ctx: SplitContext) -> Self {
        Self { ctx }
    }

    /// Runs the search for a sender session to completion.
    pub async fn run(&self, handle: SessionHandle) -> SearchOutcome {
        let search = {
            let s = handle.lock().await;
            if s.is_terminal() {
                return SearchOutcome::Discarded;
            }
            Search {
                payment_hash: s.payment_hash(),
                peer_id: s.peer_id(),
                amount: s.remaining(),
                deadline: s
                    .deadline()
                    .unwrap_or_else(|| Instant::now() + self.ctx.config.search_timeout),
            }
        };

        let result = self.search(&handle, &search).await;
        self.conclude(&handle, &search, result).await
    }

    async fn search(&self, handle: &SessionHandle, search: &Search) -> Result<u32, SplitError> {
        let not_found = || SplitError::RouteNotFound {
            amount: search.amount,
        };
        let mut attempt = 0u32;

        loop {
            let now = Instant::now();
            if now >= search.deadline {
                return Err(not_found());
            }

            let exclusions = {
                let s = handle.lock().await;
                if s.is_terminal() {
                    return Err(SplitError::ProtocolRace {
                        payment_hash: search.payment_hash,
                        what: format!("session {} during search", s.state()),
                    });
                }
                s.exclusions()
            };
            attempt += 1;

            let route = match tokio::time::timeout(
                search.deadline - now,
                self.ctx
                    .payments
                    .find_route(&search.peer_id, search.amount, &exclusions),
            )
            .await
            {
                Ok(found) => found?.ok_or_else(not_found)?,
                Err(_) => return Err(not_found()),
            };
            debug!(
                "Attempt {} for {}: paying {} over {} hops, excluding {:?}",
                attempt,
                search.payment_hash,
                search.amount,
                route.len(),
                exclusions.iter().map(|e| e.to_string()).collect::<Vec<_>>()
            );

            {
                let mut s = handle.lock().await;
                // Fails only if the session already ended; the next
                // iteration notices that.
                let _ = s.advance(SplitState::Forwarding);
            }
            self.ctx
                .payments
                .send_route(&route, &search.payment_hash)
                .await?;

            let detail = match self.ctx.payments.await_outcome(&search.payment_hash).await? {
                PaymentOutcome::Settled(_) => return Ok(attempt),
                PaymentOutcome::Failed(detail) => detail,
            };

            if detail.erring_node == Some(search.peer_id) {
                return Err(SplitError::ForwardFailure(format!(
                    "{} refused the remainder: {}",
                    search.peer_id, detail.message
                )));
            }
            let Some(edge) = detail.erring_edge() else {
                return Err(SplitError::ForwardFailure(detail.message));
            };

            let fresh = handle.lock().await.exclude(edge);
            self.ctx
                .events
                .emit(SplitEvent::AlternateAttemptFailed {
                    payment_hash: search.payment_hash,
                    attempt,
                    excluded: Some(edge),
                    reason: detail.message.clone(),
                })
                .await;
            if !fresh {
                return Err(SplitError::ForwardFailure(format!(
                    "{} failed again although it was excluded",
                    edge
                )));
            }
        }
    }

    async fn conclude(
        &self,
        handle: &SessionHandle,
        search: &Search,
        result: Result<u32, SplitError>,
    ) -> SearchOutcome {
        let hash = search.payment_hash;
        let outcome = if result.is_ok() {
            SplitState::Resolved
        } else {
            SplitState::Failed
        };

        let mut session = handle.lock().await;
        let phase = session.state();
        if session.terminate(outcome).is_none() {
            debug!(
                "Dropping search result for {}: session already {}",
                hash, phase
            );
            return SearchOutcome::Discarded;
        }
        let role = session.role();
        let duration_ms = session.duration_ms();
        drop(session);
        self.ctx.store.remove(&hash, handle).await;

        match result {
            Ok(attempts) => {
                info!(
                    "Delivered remainder {} of {} after {} attempts",
                    search.amount, hash, attempts
                );
                self.ctx
                    .events
                    .emit(SplitEvent::SessionResolved {
                        payment_hash: hash,
                        role,
                        duration_ms,
                    })
                    .await;
                SearchOutcome::Delivered { attempts }
            }
            Err(e) => {
                warn!("Alternate route search for {} failed: {}", hash, e);
                if let Err(send_err) = SplitMessaging::new(self.ctx.clone())
                    .fail(&search.peer_id, hash)
                    .await
                {
                    warn!("Could not abandon split of {}: {:#}", hash, send_err);
                }
                self.ctx
                    .events
                    .emit(SplitEvent::SessionFailed {
                        payment_hash: hash,
                        role,
                        phase,
                        reason: e.to_string(),
                        duration_ms,
                    })
                    .await;
                SearchOutcome::Failed(e)
            }
        }
    }
}
