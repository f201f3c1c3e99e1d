//! Name channel
//!
//! Async handle around a [`SyncEngine`]. The engine lives on its own tokio
//! task and processes commands from an mpsc queue one at a time, so no two
//! chain mutations ever interleave. Lookups bypass the queue and take the
//! chain's read lock directly.

use super::{NameChannelDelegate, SyncEngine};
use crate::config::ChannelConfig;
use crate::consensus::{NameBlock, NameTrx};
use crate::error::NameError;
use crate::p2p::{PeerId, Transport};
use crate::storage::{ChainState, ChainStats, NameClaim, SledTableStore};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

const COMMAND_QUEUE_DEPTH: usize = 1024;
const TICK_INTERVAL: Duration = Duration::from_secs(1);

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Deliver(PeerId, Vec<u8>),
    PeerConnected(PeerId, Option<SocketAddr>),
    PeerDisconnected(PeerId),
    SubmitName(NameTrx, Reply<Result<bool, NameError>>),
    SubmitBlock(NameBlock, Reply<Result<bool, NameError>>),
    SetDelegate(Option<Arc<dyn NameChannelDelegate>>),
    Configure(ChannelConfig),
    PeerCount(Reply<usize>),
    Shutdown(Reply<()>),
}

#[derive(Clone)]
pub struct NameChannel {
    commands: mpsc::Sender<Command>,
    chain: Arc<RwLock<ChainState>>,
}

impl NameChannel {
    /// Open the chain named by `config` and start the engine task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<T>(config: ChannelConfig, transport: T) -> Result<(Self, JoinHandle<()>), NameError>
    where
        T: Transport + 'static,
    {
        let chain = match &config.name_db_dir {
            Some(dir) => {
                info!(path = %dir.display(), "opening name database");
                let store = SledTableStore::open(dir)?;
                ChainState::open(Box::new(store), config.rules())?
            }
            None => ChainState::in_memory(config.rules())?,
        };
        Ok(Self::with_chain(chain, config, transport))
    }

    /// Start the engine task on an already opened chain
    pub fn with_chain<T>(chain: ChainState, config: ChannelConfig, transport: T) -> (Self, JoinHandle<()>)
    where
        T: Transport + 'static,
    {
        let chain = Arc::new(RwLock::new(chain));
        let engine = SyncEngine::new(Arc::clone(&chain), transport, config);
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let handle = tokio::spawn(run(engine, rx));
        (Self { commands, chain }, handle)
    }

    async fn send(&self, command: Command) -> Result<(), NameError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| NameError::ChannelClosed)
    }

    async fn request<R>(&self, command: impl FnOnce(Reply<R>) -> Command) -> Result<R, NameError> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply)).await?;
        rx.await.map_err(|_| NameError::ChannelClosed)
    }

    /// Hand raw bytes received from `peer` to the engine
    pub async fn deliver(&self, peer: PeerId, bytes: Vec<u8>) -> Result<(), NameError> {
        self.send(Command::Deliver(peer, bytes)).await
    }

    pub async fn peer_connected(&self, peer: PeerId, addr: Option<SocketAddr>) -> Result<(), NameError> {
        self.send(Command::PeerConnected(peer, addr)).await
    }

    pub async fn peer_disconnected(&self, peer: PeerId) -> Result<(), NameError> {
        self.send(Command::PeerDisconnected(peer)).await
    }

    /// Submit a local name registration, same path as a peer's
    pub async fn submit_name(&self, trx: NameTrx) -> Result<bool, NameError> {
        self.request(|reply| Command::SubmitName(trx, reply)).await?
    }

    /// Submit a locally mined block, same path as a peer's
    pub async fn submit_block(&self, block: NameBlock) -> Result<bool, NameError> {
        self.request(|reply| Command::SubmitBlock(block, reply)).await?
    }

    pub async fn set_delegate(&self, delegate: Option<Arc<dyn NameChannelDelegate>>) -> Result<(), NameError> {
        self.send(Command::SetDelegate(delegate)).await
    }

    pub async fn configure(&self, config: ChannelConfig) -> Result<(), NameError> {
        self.send(Command::Configure(config)).await
    }

    pub async fn peer_count(&self) -> Result<usize, NameError> {
        self.request(Command::PeerCount).await
    }

    /// Stop the engine task after the commands queued so far
    pub async fn shutdown(&self) -> Result<(), NameError> {
        self.request(Command::Shutdown).await
    }

    pub fn lookup_name(&self, name: &str) -> Option<NameClaim> {
        self.chain
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .lookup(name)
            .cloned()
    }

    pub fn stats(&self) -> ChainStats {
        self.chain.read().unwrap_or_else(|e| e.into_inner()).stats()
    }

    /// Shared chain for read-only consumers (RPC, miner)
    pub fn chain(&self) -> Arc<RwLock<ChainState>> {
        Arc::clone(&self.chain)
    }
}

async fn run<T: Transport>(mut engine: SyncEngine<T>, mut rx: mpsc::Receiver<Command>) {
    let mut ticker = interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else { break };
                match command {
                    Command::Deliver(peer, bytes) => {
                        if let Err(e) = engine.handle_message(peer, &bytes) {
                            debug!(%peer, kind = e.kind(), "delivery rejected");
                        }
                    }
                    Command::PeerConnected(peer, addr) => engine.peer_connected(peer, addr),
                    Command::PeerDisconnected(peer) => engine.peer_disconnected(peer),
                    Command::SubmitName(trx, reply) => {
                        let _ = reply.send(engine.submit_name(trx));
                    }
                    Command::SubmitBlock(block, reply) => {
                        let _ = reply.send(engine.submit_block(block));
                    }
                    Command::SetDelegate(delegate) => engine.set_delegate(delegate),
                    Command::Configure(config) => engine.configure(config),
                    Command::PeerCount(reply) => {
                        let _ = reply.send(engine.peers().connected_count());
                    }
                    Command::Shutdown(reply) => {
                        let _ = reply.send(());
                        break;
                    }
                }
            }
            now = ticker.tick() => engine.tick(now.into_std()),
        }
    }
    info!("name channel stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::OwnerKey;
    use crate::p2p::{MemoryTransport, NameInvMsg, NameMessage, Outbound};

    fn lenient() -> ChannelConfig {
        ChannelConfig {
            min_name_difficulty: 0,
            min_block_difficulty: 0,
            ..ChannelConfig::default()
        }
    }

    #[tokio::test]
    async fn test_submit_and_lookup_through_channel() {
        let transport = Arc::new(MemoryTransport::new());
        let (channel, task) = NameChannel::spawn(lenient(), Arc::clone(&transport)).unwrap();

        let trx = NameTrx::new("carol", OwnerKey([3u8; 32]), 1);
        assert!(channel.submit_name(trx.clone()).await.unwrap());
        assert!(!channel.submit_name(trx.clone()).await.unwrap());

        let genesis = channel.chain().read().unwrap().genesis();
        let block = NameBlock::new(genesis, 1, 10, vec![trx.clone()]);
        assert!(channel.submit_block(block).await.unwrap());

        let claim = channel.lookup_name("carol").unwrap();
        assert_eq!(claim.owner, OwnerKey([3u8; 32]));
        assert_eq!(channel.stats().height, 1);
        assert_eq!(channel.stats().pending, 0);

        let sent = transport.take();
        assert!(sent.contains(&Outbound::Broadcast(
            NameMessage::NameInv(NameInvMsg { names: vec![trx.id()] }),
            None
        )));

        channel.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(matches!(
            channel.submit_name(trx).await,
            Err(NameError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_peer_count_follows_connections() {
        let (channel, _task) = NameChannel::spawn(lenient(), MemoryTransport::new()).unwrap();
        channel.peer_connected(PeerId(1), None).await.unwrap();
        channel.peer_connected(PeerId(2), None).await.unwrap();
        channel.peer_disconnected(PeerId(1)).await.unwrap();
        assert_eq!(channel.peer_count().await.unwrap(), 1);
    }
}
