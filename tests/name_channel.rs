//! Async name channel tests

mod common;

use bitname::config::ChannelConfig;
use bitname::consensus::NameBlock;
use bitname::error::NameError;
use bitname::p2p::{MemoryTransport, NameBlockMsg, NameMessage, Outbound, PeerId};
use bitname::sync::{NameChannel, NameChannelDelegate};
use common::*;
use std::sync::Arc;
use std::time::Duration;

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_delegate_sees_submissions_once() {
    let transport = Arc::new(MemoryTransport::new());
    let (channel, _task) = NameChannel::spawn(lenient_config(), Arc::clone(&transport)).unwrap();
    let delegate = Arc::new(RecordingDelegate::default());
    let dyn_delegate: Arc<dyn NameChannelDelegate> = delegate.clone();
    channel.set_delegate(Some(dyn_delegate)).await.unwrap();

    let trx = claim("ivan", 9);
    assert!(channel.submit_name(trx.clone()).await.unwrap());
    assert!(!channel.submit_name(trx.clone()).await.unwrap());
    assert_eq!(delegate.pending(), vec![trx.id()]);

    let block = child(&NameBlock::genesis(), vec![trx], 0);
    assert!(channel.submit_block(block.clone()).await.unwrap());
    assert!(!channel.submit_block(block.clone()).await.unwrap());
    assert_eq!(delegate.blocks(), vec![block.id()]);
    assert_eq!(channel.lookup_name("ivan").unwrap().owner, key(9));

    // swapping the delegate out stops notifications
    channel.set_delegate(None).await.unwrap();
    let next = child(&block, vec![claim("judy", 10)], 0);
    assert!(channel.submit_block(next).await.unwrap());
    assert_eq!(delegate.blocks().len(), 1);
    assert_eq!(channel.lookup_name("judy").unwrap().height, 2);
}

#[tokio::test]
async fn test_rejections_reach_the_caller() {
    let config = ChannelConfig {
        min_name_difficulty: 200,
        ..lenient_config()
    };
    let (channel, _task) = NameChannel::spawn(config, MemoryTransport::new()).unwrap();
    assert!(matches!(
        channel.submit_name(claim("kim", 1)).await,
        Err(NameError::InvalidProofOfWork { .. })
    ));

    let orphan = child(&child(&NameBlock::genesis(), vec![], 0), vec![], 0);
    assert!(matches!(
        channel.submit_block(orphan).await,
        Err(NameError::UnknownParent { .. })
    ));
    assert_eq!(channel.stats().height, 0);
}

#[tokio::test]
async fn test_delivered_blocks_are_relayed() {
    let transport = Arc::new(MemoryTransport::new());
    let (channel, _task) = NameChannel::spawn(lenient_config(), Arc::clone(&transport)).unwrap();
    let peer = PeerId(3);
    channel.peer_connected(peer, None).await.unwrap();

    let block = child(&NameBlock::genesis(), vec![claim("liam", 11)], 0);
    let bytes = NameMessage::NameBlock(NameBlockMsg { block: block.clone() })
        .encode()
        .unwrap();
    channel.deliver(peer, bytes).await.unwrap();

    wait_for(|| channel.lookup_name("liam").is_some()).await;
    assert_eq!(channel.stats().head, block.id());
    let sent = transport.take();
    assert!(sent.iter().any(|out| matches!(
        out,
        Outbound::Broadcast(NameMessage::BlockInv(_), Some(p)) if *p == peer
    )));
}

#[tokio::test]
async fn test_configure_changes_rules() {
    let (channel, _task) = NameChannel::spawn(lenient_config(), MemoryTransport::new()).unwrap();
    channel
        .configure(ChannelConfig {
            min_block_difficulty: 200,
            ..lenient_config()
        })
        .await
        .unwrap();

    let block = child(&NameBlock::genesis(), vec![], 0);
    assert!(matches!(
        channel.submit_block(block).await,
        Err(NameError::InvalidProofOfWork { .. })
    ));
}

#[tokio::test]
async fn test_sled_backed_channel_survives_restart() {
    let dir = std::env::temp_dir().join(format!(
        "bitname-channel-{}-{}",
        std::process::id(),
        rand::random::<u32>()
    ));
    let config = ChannelConfig {
        name_db_dir: Some(dir.clone()),
        ..lenient_config()
    };

    let block = child(&NameBlock::genesis(), vec![claim("mallory", 12)], 0);
    {
        let (channel, task) = NameChannel::spawn(config.clone(), MemoryTransport::new()).unwrap();
        assert!(channel.submit_block(block.clone()).await.unwrap());
        channel.shutdown().await.unwrap();
        task.await.unwrap();
    }

    let (channel, _task) = NameChannel::spawn(config, MemoryTransport::new()).unwrap();
    assert_eq!(channel.stats().head, block.id());
    assert_eq!(channel.lookup_name("mallory").unwrap().owner, key(12));
    channel.shutdown().await.unwrap();
    drop(channel);
    let _ = std::fs::remove_dir_all(&dir);
}
