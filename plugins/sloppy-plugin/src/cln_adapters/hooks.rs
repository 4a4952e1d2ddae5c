//! Hook handlers
//!
//! Translate the `htlc_accepted` and `custommsg` hook payloads into calls on
//! the split components and their outcomes back into hook responses. A
//! payload we cannot parse is answered with `continue`, so `lightningd`
//! handles the HTLC or message as if the plugin were absent.

use log::{debug, warn};
use serde_json::{json, Value};

use super::model::{CustomMsgRequest, HtlcAcceptedRequest, HtlcAcceptedResponse};
use crate::core::split::continuation::{Continuation, HtlcResponse};
use crate::core::split::gatekeeper::{Gatekeeper, IncomingHtlc};
use crate::core::split::messaging::{MessageOutcome, SplitMessaging};
use crate::core::split::SplitContext;

#[derive(Clone)]
pub struct HookHandler {
    gatekeeper: Gatekeeper,
    messaging: SplitMessaging,
}

impl HookHandler {
    pub fn new(ctx: SplitContext) -> Self {
        Self {
            gatekeeper: Gatekeeper::new(ctx.clone()),
            messaging: SplitMessaging::new(ctx),
        }
    }

    /// Answers once the gatekeeper, or whoever holds the continuation,
    /// resolves the HTLC. This may take as long as a split is pending.
    pub async fn on_htlc_accepted(&self, v: Value) -> Result<Value, anyhow::Error> {
        let req: HtlcAcceptedRequest = match serde_json::from_value(v) {
            Ok(req) => req,
            Err(e) => {
                warn!("Unparseable htlc_accepted payload, continuing: {}", e);
                return Ok(serde_json::to_value(
                    HtlcAcceptedResponse::continue_unmodified(),
                )?);
            }
        };
        let htlc = IncomingHtlc::from(req);
        let leg = htlc.leg;

        let (continuation, answer) = Continuation::channel(leg);
        let decision = self.gatekeeper.on_htlc(htlc, continuation).await;
        debug!("Htlc {}: {:?}", leg, decision);

        let response = answer.await.unwrap_or_else(|_| {
            warn!("Htlc {} was dropped without an answer, failing it", leg);
            HtlcResponse::temporary_failure()
        });
        Ok(serde_json::to_value(HtlcAcceptedResponse::from(response))?)
    }

    pub async fn on_custommsg(&self, v: Value) -> Result<Value, anyhow::Error> {
        let continue_response = json!({ "result": "continue" });
        let msg: CustomMsgRequest = match serde_json::from_value(v) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Unparseable custommsg payload: {}", e);
                return Ok(continue_response);
            }
        };

        match self.messaging.on_message(msg.peer_id, &msg.payload).await {
            MessageOutcome::NotSplit => {}
            outcome => debug!("Split message from {}: {:?}", msg.peer_id, outcome),
        }
        Ok(continue_response)
    }
}
