//! Transport collaborator
//!
//! The sync engine only ever talks to peers through this trait. Inbound
//! bytes reach the engine through `SyncEngine::handle_message`.

use super::{NameMessage, PeerId};
use std::sync::Mutex;

/// Outbound side of the peer-to-peer transport
pub trait Transport: Send + Sync {
    /// Queue a message for one peer
    fn send(&self, peer: PeerId, message: NameMessage);

    /// Queue a message for every connected peer except `excluding`
    fn broadcast(&self, message: NameMessage, excluding: Option<PeerId>);

    /// Drop the connection to a peer
    fn disconnect(&self, _peer: PeerId) {}
}

/// A message handed to a [`MemoryTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Direct(PeerId, NameMessage),
    Broadcast(NameMessage, Option<PeerId>),
    Disconnect(PeerId),
}

/// Transport that records everything it is asked to do
#[derive(Debug, Default)]
pub struct MemoryTransport {
    outbound: Mutex<Vec<Outbound>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain recorded messages
    pub fn take(&self) -> Vec<Outbound> {
        let mut outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *outbound)
    }

    fn record(&self, item: Outbound) {
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(item);
    }
}

impl Transport for MemoryTransport {
    fn send(&self, peer: PeerId, message: NameMessage) {
        self.record(Outbound::Direct(peer, message));
    }

    fn broadcast(&self, message: NameMessage, excluding: Option<PeerId>) {
        self.record(Outbound::Broadcast(message, excluding));
    }

    fn disconnect(&self, peer: PeerId) {
        self.record(Outbound::Disconnect(peer));
    }
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn send(&self, peer: PeerId, message: NameMessage) {
        (**self).send(peer, message)
    }

    fn broadcast(&self, message: NameMessage, excluding: Option<PeerId>) {
        (**self).broadcast(message, excluding)
    }

    fn disconnect(&self, peer: PeerId) {
        (**self).disconnect(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::{GetBlockMsg, NameInvMsg};
    use crate::crypto::MiniPow;

    #[test]
    fn test_memory_transport_records_in_order() {
        let transport = MemoryTransport::new();
        let inv = NameMessage::NameInv(NameInvMsg { names: vec![1] });
        let get = NameMessage::GetBlock(GetBlockMsg { block_id: MiniPow::zero() });
        transport.broadcast(inv.clone(), Some(PeerId(1)));
        transport.send(PeerId(2), get.clone());

        assert_eq!(
            transport.take(),
            vec![
                Outbound::Broadcast(inv, Some(PeerId(1))),
                Outbound::Direct(PeerId(2), get)
            ]
        );
        assert!(transport.take().is_empty());
    }
}
