use std::sync::Arc;

use blockrelay_node::cli::Cli;
use blockrelay_node::domain::{BlockHeader, MapChainView, NULL_HASH};
use blockrelay_node::network::NetworkManager;
use blockrelay_node::node::NodeState;
use blockrelay_node::utils::{init_logging_from_config, wait_for_shutdown_signal};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    init_logging_from_config(Some(&config.logging));

    let listen_addr = config
        .listen_addr
        .ok_or_else(|| anyhow::anyhow!("no listen address: pass --listen or set listen_addr in the config file"))?;

    // No chainstate collaborator wired up yet, so seed an empty genesis.
    // A real deployment backs `ChainView` with its own chainstate database.
    let genesis = BlockHeader { version: 1, prev_block_hash: NULL_HASH, merkle_root: NULL_HASH, timestamp: 0, bits: 0, nonce: 0 };
    let chain = MapChainView::new_with_genesis(genesis);
    let node = Arc::new(NodeState::new(config.clone(), chain));
    let network = Arc::new(NetworkManager::new(config, Arc::clone(&node)));

    info!(%listen_addr, "starting blockrelay-node");
    let run_handle = tokio::spawn(Arc::clone(&network).run(listen_addr));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, exiting");
    run_handle.abort();
    Ok(())
}
