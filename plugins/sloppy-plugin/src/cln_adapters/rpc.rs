//! Collaborators backed by the `lightningd` JSON-RPC.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use cln_rpc::primitives::Amount;
use cln_rpc::{ClnRpc, RpcError};

use super::model::{
    FirstHopJson, GetRouteRequest, GetRouteResponse, Ignored, ListPeerChannelsRequest,
    ListPeerChannelsResponse, ListPeersRequest, ListPeersResponse, PeerChannelEntry,
    RouteHopJson, SendCustomMsgRequest, SendOnionRequest, SendPayRequest, WaitSendPayErrorData,
    WaitSendPayRequest, WaitSendPayResponse,
};
use crate::core::split::provider::{
    ChannelDirectory, FailureDetail, FirstHop, PaymentOutcome, PaymentProvider, PeerChannel,
    PeerMessenger, RouteHop,
};
use crate::core::split::session::Exclusion;
use crate::core::split::SPLIT_FEATURE_BIT;
use crate::proto::primitives::{
    FeePolicy, Msat, PaymentHash, Ppm, PublicKey, ShortChannelId,
};
use crate::util::has_feature_bit;

/// `getroute` could not find a route.
const ROUTE_NOT_FOUND: i32 = 205;
const RISK_FACTOR: u64 = 10;
const CHANNELD_NORMAL: &str = "CHANNELD_NORMAL";

#[derive(Clone)]
pub struct ClnApiRpc {
    rpc_path: PathBuf,
}

impl ClnApiRpc {
    pub fn new(rpc_path: PathBuf) -> Self {
        Self { rpc_path }
    }

    async fn create_rpc(&self) -> Result<ClnRpc> {
        ClnRpc::new(&self.rpc_path).await
    }
}

fn to_peer_channel(ch: PeerChannelEntry, scid: ShortChannelId) -> PeerChannel {
    PeerChannel {
        short_channel_id: scid,
        peer_id: ch.peer_id,
        peer_connected: ch.peer_connected,
        active: ch.state == CHANNELD_NORMAL,
        spendable: Msat(ch.spendable_msat.map(|a| a.msat()).unwrap_or(0)),
        direction: ch.direction.unwrap_or(0),
        fee_policy: FeePolicy::new(
            Msat(ch.fee_base_msat.map(|a| a.msat()).unwrap_or(0)),
            Ppm(ch.fee_proportional_millionths.unwrap_or(0)),
        ),
    }
}

#[async_trait]
impl ChannelDirectory for ClnApiRpc {
    async fn get_channel(&self, scid: &ShortChannelId) -> Result<Option<PeerChannel>> {
        let mut rpc = self.create_rpc().await?;
        let res: ListPeerChannelsResponse = rpc
            .call_raw(
                "listpeerchannels",
                &ListPeerChannelsRequest {
                    short_channel_id: Some(*scid),
                },
            )
            .await
            .map_err(anyhow::Error::new)
            .with_context(|| "calling listpeerchannels")?;

        Ok(res
            .channels
            .into_iter()
            .find(|ch| ch.short_channel_id.as_ref() == Some(scid))
            .map(|ch| to_peer_channel(ch, *scid)))
    }

    async fn peer_supports_split(&self, peer_id: &PublicKey) -> Result<bool> {
        let mut rpc = self.create_rpc().await?;
        let res: ListPeersResponse = rpc
            .call_raw("listpeers", &ListPeersRequest { id: *peer_id })
            .await
            .map_err(anyhow::Error::new)
            .with_context(|| "calling listpeers")?;

        let Some(peer) = res.peers.into_iter().find(|p| p.id == *peer_id) else {
            return Ok(false);
        };
        match peer.features {
            Some(features) if peer.connected => has_feature_bit(&features, SPLIT_FEATURE_BIT),
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl PaymentProvider for ClnApiRpc {
    async fn find_route(
        &self,
        destination: &PublicKey,
        amount: Msat,
        exclusions: &[Exclusion],
    ) -> Result<Option<Vec<RouteHop>>> {
        let mut rpc = self.create_rpc().await?;
        let req = GetRouteRequest {
            id: *destination,
            amount_msat: Amount::from_msat(amount.msat()),
            riskfactor: RISK_FACTOR,
            exclude: exclusions.iter().map(|e| e.to_string()).collect(),
        };
        let res: Result<GetRouteResponse, RpcError> = rpc.call_raw("getroute", &req).await;
        match res {
            Ok(res) => Ok(Some(
                res.route
                    .into_iter()
                    .map(|h| RouteHop {
                        id: h.id,
                        channel: h.channel,
                        direction: h.direction,
                        amount: Msat(h.amount_msat.msat()),
                        delay: h.delay,
                    })
                    .collect(),
            )),
            Err(e) if e.code == Some(ROUTE_NOT_FOUND) => {
                log::debug!("getroute to {} for {}: {}", destination, amount, e.message);
                Ok(None)
            }
            Err(e) => Err(anyhow::Error::new(e)).with_context(|| "calling getroute"),
        }
    }

    async fn send_route(&self, route: &[RouteHop], payment_hash: &PaymentHash) -> Result<()> {
        let mut rpc = self.create_rpc().await?;
        let req = SendPayRequest {
            route: route
                .iter()
                .map(|h| RouteHopJson {
                    id: h.id,
                    channel: h.channel,
                    direction: h.direction,
                    amount_msat: Amount::from_msat(h.amount.msat()),
                    delay: h.delay,
                    style: Some("tlv".to_string()),
                })
                .collect(),
            payment_hash: *payment_hash,
        };
        let _: Ignored = rpc
            .call_raw("sendpay", &req)
            .await
            .map_err(anyhow::Error::new)
            .with_context(|| "calling sendpay")?;
        Ok(())
    }

    async fn send_onion(
        &self,
        first_hop: &FirstHop,
        onion: &[u8],
        payment_hash: &PaymentHash,
    ) -> Result<()> {
        let mut rpc = self.create_rpc().await?;
        let req = SendOnionRequest {
            onion: hex::encode(onion),
            first_hop: FirstHopJson {
                id: first_hop.id,
                amount_msat: Amount::from_msat(first_hop.amount.msat()),
                delay: first_hop.delay,
            },
            payment_hash: *payment_hash,
        };
        let _: Ignored = rpc
            .call_raw("sendonion", &req)
            .await
            .map_err(anyhow::Error::new)
            .with_context(|| "calling sendonion")?;
        Ok(())
    }

    async fn await_outcome(&self, payment_hash: &PaymentHash) -> Result<PaymentOutcome> {
        let mut rpc = self.create_rpc().await?;
        let res: Result<WaitSendPayResponse, RpcError> = rpc
            .call_raw(
                "waitsendpay",
                &WaitSendPayRequest {
                    payment_hash: *payment_hash,
                },
            )
            .await;

        match res {
            Ok(WaitSendPayResponse {
                payment_preimage: Some(preimage),
                ..
            }) => Ok(PaymentOutcome::Settled(preimage)),
            Ok(res) => Err(anyhow!(
                "waitsendpay returned status {} without preimage",
                res.status
            )),
            Err(e) => {
                let data: WaitSendPayErrorData = match e.data.clone() {
                    Some(data) => serde_json::from_value(data)
                        .with_context(|| format!("parsing waitsendpay error {}", e.message))?,
                    None => return Err(anyhow::Error::new(e)).with_context(|| "calling waitsendpay"),
                };
                Ok(PaymentOutcome::Failed(FailureDetail {
                    erring_channel: data.erring_channel,
                    erring_direction: data.erring_direction,
                    erring_node: data.erring_node,
                    onion_reply: data.onionreply,
                    message: data.failcodename.unwrap_or(e.message),
                }))
            }
        }
    }
}

#[async_trait]
impl PeerMessenger for ClnApiRpc {
    async fn send_custom_msg(&self, peer_id: &PublicKey, msg: &[u8]) -> Result<()> {
        let mut rpc = self.create_rpc().await?;
        let _: Ignored = rpc
            .call_raw(
                "sendcustommsg",
                &SendCustomMsgRequest {
                    node_id: *peer_id,
                    msg: hex::encode(msg),
                },
            )
            .await
            .map_err(anyhow::Error::new)
            .with_context(|| "calling sendcustommsg")?;
        Ok(())
    }
}
