use std::path::Path;
use std::sync::Arc;

use cln_plugin::Plugin;
use cln_sloppy::cln_adapters::hooks::HookHandler;
use cln_sloppy::cln_adapters::rpc::ClnApiRpc;
use cln_sloppy::core::split::provider::LoggingEventEmitter;
use cln_sloppy::core::split::timeouts::ExpirySweeper;
use cln_sloppy::core::split::{SplitContext, SPLIT_FEATURE_BIT};
use cln_sloppy::options::Options;
use cln_sloppy::util;

#[derive(Clone)]
struct State {
    hooks: HookHandler,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let options = Options::new();
    let builder = cln_plugin::Builder::new(tokio::io::stdin(), tokio::io::stdout())
        .featurebits(
            cln_plugin::FeatureBitsKind::Init,
            util::feature_bit_to_hex(SPLIT_FEATURE_BIT),
        )
        .hook("htlc_accepted", on_htlc_accepted)
        .hook("custommsg", on_custommsg);

    let Some(plugin) = options.clone().register_with_builder(builder).configure().await? else {
        return Ok(());
    };

    let config = match options.extract_config(&plugin) {
        Ok(config) => config,
        Err(e) => return plugin.disable(&e.to_string()).await,
    };

    let dir = plugin.configuration().lightning_dir;
    let rpc_path = Path::new(&dir).join(&plugin.configuration().rpc_file);
    let rpc = Arc::new(ClnApiRpc::new(rpc_path));

    let ctx = SplitContext::new(
        rpc.clone(),
        rpc.clone(),
        rpc,
        Arc::new(LoggingEventEmitter),
        config.split_config(),
    );
    log::info!(
        "Split forwarding enabled, alternate route search budget {:?}",
        config.search_timeout()
    );

    let sweeper = ExpirySweeper::new(ctx.clone()).spawn();
    let state = State {
        hooks: HookHandler::new(ctx),
    };

    let plugin = plugin.start(state).await?;
    let res = plugin.join().await;
    sweeper.abort();
    res
}

async fn on_htlc_accepted(
    p: Plugin<State>,
    v: serde_json::Value,
) -> Result<serde_json::Value, anyhow::Error> {
    p.state().hooks.on_htlc_accepted(v).await
}

async fn on_custommsg(
    p: Plugin<State>,
    v: serde_json::Value,
) -> Result<serde_json::Value, anyhow::Error> {
    p.state().hooks.on_custommsg(v).await
}
