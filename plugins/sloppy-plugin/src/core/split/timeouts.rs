//! Expiry of receiver sessions.
//!
//! A receiver holds the legs of a split until they cover the forward. If
//! the sender never delivers the remainder and its `SPLIT_FAIL` gets lost,
//! the legs would be held until their CLTV runs out. The sweeper fails
//! every receiver session that has not started forwarding within the
//! sender's search budget plus a grace period.
//!
//! ```ignore
//! let handle = ExpirySweeper::new(ctx).spawn();
//! // ... later
//! handle.abort();
//! ```

use log::{debug, info};
use tokio::task::JoinHandle;

use super::continuation::HtlcResponse;
use super::session::{Role, SplitEvent, SplitState};
use super::SplitContext;

pub struct ExpirySweeper {
    ctx: SplitContext,
}

impl ExpirySweeper {
    pub fn new(ctx: SplitContext) -> Self {
        Self { ctx }
    }

    /// Starts the sweeper as a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        let mut interval = tokio::time::interval(self.ctx.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let expired = self.sweep().await;
            if expired > 0 {
                debug!("Expired {} receiver sessions", expired);
            }
        }
    }

    /// Fails every expired receiver session. Returns how many were failed.
    pub async fn sweep(&self) -> usize {
        let expiry = self.ctx.config.receiver_expiry();
        let mut expired = 0;

        for (payment_hash, handle) in self.ctx.store.list(Role::Receiver).await {
            let mut session = handle.lock().await;
            let phase = session.state();
            if phase == SplitState::Forwarding || session.created_at().elapsed() < expiry {
                continue;
            }
            let Some(held) = session.terminate(SplitState::Failed) else {
                continue;
            };
            let duration_ms = session.duration_ms();
            drop(session);

            let failed = held.resolve_all(HtlcResponse::temporary_failure());
            self.ctx.store.remove(&payment_hash, &handle).await;
            info!(
                "Split of {} expired in {}, failed {} held legs",
                payment_hash, phase, failed
            );
            self.ctx
                .events
                .emit(SplitEvent::SessionFailed {
                    payment_hash,
                    role: Role::Receiver,
                    phase,
                    reason: "receiver session expired".to_string(),
                    duration_ms,
                })
                .await;
            expired += 1;
        }

        expired
    }
}
