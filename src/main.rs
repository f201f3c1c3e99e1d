//! Bitname Node
//!
//! Main entry point for running a name registry node.

use bitname::config::{LoggingConfig, NodeConfig};
use bitname::consensus::unix_now;
use bitname::mining::{Miner, MiningResult};
use bitname::p2p::{TcpTransport, TransportEvent};
use bitname::rpc::{start_rpc_server, RpcState};
use bitname::sync::NameChannel;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},bitname={}", config.level, config.level)));
    let registry = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(false);
        registry.with(fmt_layer).init();
    }
}

/// First CLI argument overrides `BITNAME_CONFIG`
fn load_config() -> Result<NodeConfig, Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::load()?,
    };
    config.validate()?;
    Ok(config)
}

/// Forward transport events into the channel until either side closes
async fn pump_events(mut events: mpsc::Receiver<TransportEvent>, channel: NameChannel) {
    while let Some(event) = events.recv().await {
        let delivered = match event {
            TransportEvent::Connected(peer, addr) => channel.peer_connected(peer, Some(addr)).await,
            TransportEvent::Message(peer, bytes) => channel.deliver(peer, bytes).await,
            TransportEvent::Disconnected(peer) => channel.peer_disconnected(peer).await,
        };
        if delivered.is_err() {
            break;
        }
    }
}

/// Mine pending names on the current head with `threads` workers, each
/// searching its own slice of the nonce space
async fn mining_loop(miner: Miner, channel: NameChannel, threads: usize) {
    let chain = channel.chain();
    loop {
        let candidate = {
            let chain = chain.read().unwrap_or_else(|e| e.into_inner());
            let block = miner.assemble_block(&chain, unix_now());
            (!block.trxs.is_empty()).then(|| (block, chain.rules().min_block_difficulty))
        };
        let Some((template, difficulty)) = candidate else {
            sleep(Duration::from_secs(1)).await;
            continue;
        };

        let (tx, mut rx) = mpsc::channel(threads);
        miner.reset();
        for i in 0..threads {
            let worker = miner.clone();
            let chain = Arc::clone(&chain);
            let tx = tx.clone();
            let mut block = template.clone();
            block.header.nonce = i as u64 * (u64::MAX / threads as u64);

            tokio::task::spawn_blocking(move || {
                let result = worker.mine_on(block, difficulty, &chain);
                let _ = tx.blocking_send(result);
            });
        }
        drop(tx);

        let mut found = None;
        while let Some(result) = rx.recv().await {
            if let MiningResult::Success(block) = result {
                if found.is_none() {
                    found = Some(block);
                    miner.stop();
                }
            }
        }

        match found {
            Some(block) => {
                if let Err(e) = channel.submit_block(block).await {
                    warn!(error = %e, "mined block rejected");
                }
            }
            None => sleep(Duration::from_millis(100)).await,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    init_logging(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "starting bitname node");

    let listen_addr: SocketAddr = config.network.listen_addr.parse()?;
    let (transport, events) = TcpTransport::new(
        config.channel.max_message_size,
        config.network.desired_peer_count * 4,
    );
    let (channel, engine_task) = NameChannel::spawn(config.channel.clone(), Arc::clone(&transport))?;
    let stats = channel.stats();
    info!(
        height = stats.height,
        head = %stats.head.short(),
        names = stats.names,
        "chain loaded"
    );

    tokio::spawn(pump_events(events, channel.clone()));
    let _listener = transport.listen(listen_addr).await?;

    for seed in &config.network.seeds {
        match seed.parse::<SocketAddr>() {
            Ok(addr) => {
                if let Err(e) = transport.connect(addr).await {
                    warn!(%addr, error = %e, "failed to reach seed");
                }
            }
            Err(e) => warn!(seed = %seed, error = %e, "invalid seed address"),
        }
    }

    if config.rpc.enabled {
        let rpc_addr: SocketAddr = format!("{}:{}", config.rpc.bind_address, config.rpc.port).parse()?;
        let state = Arc::new(RpcState::new(channel.clone()));
        tokio::spawn(async move {
            if let Err(e) = start_rpc_server(state, rpc_addr).await {
                error!(error = %e, "RPC server failed");
            }
        });
    }

    let miner = Miner::new();
    let mining_task = config.mining.enabled.then(|| {
        info!(threads = config.mining.threads, "mining enabled");
        tokio::spawn(mining_loop(miner.clone(), channel.clone(), config.mining.threads))
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
        _ = engine_task => error!("name channel stopped unexpectedly"),
    }

    if let Some(task) = mining_task {
        task.abort();
    }
    miner.stop();
    let _ = channel.shutdown().await;
    info!("node stopped");
    Ok(())
}
