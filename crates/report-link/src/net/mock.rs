//! In-memory transports for unit tests.

use anyhow::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::net::interface::{Transport, TransportFactory, TransportKind, TransportObserver};

#[derive(Default)]
struct PeerState {
    created: usize,
    connects: usize,
    live: usize,
    kinds: Vec<TransportKind>,
    sent: Vec<Vec<u8>>,
    observer: Option<TransportObserver>,
}

#[derive(Clone, Default)]
pub struct MockFactory {
    peers: Arc<Mutex<HashMap<SocketAddr, PeerState>>>,
}

impl MockFactory {
    fn with_peer<T>(&self, address: SocketAddr, f: impl FnOnce(&PeerState) -> T) -> T {
        let peers = self.peers.lock().unwrap();
        let default = PeerState::default();
        f(peers.get(&address).unwrap_or(&default))
    }

    pub fn created(&self, address: SocketAddr) -> usize {
        self.with_peer(address, |p| p.created)
    }

    pub fn connects(&self, address: SocketAddr) -> usize {
        self.with_peer(address, |p| p.connects)
    }

    pub fn live(&self, address: SocketAddr) -> usize {
        self.with_peer(address, |p| p.live)
    }

    pub fn total_live(&self) -> usize {
        self.peers.lock().unwrap().values().map(|p| p.live).sum()
    }

    pub fn last_kind(&self, address: SocketAddr) -> Option<TransportKind> {
        self.with_peer(address, |p| p.kinds.last().copied())
    }

    pub fn sent(&self, address: SocketAddr) -> Vec<Vec<u8>> {
        self.with_peer(address, |p| p.sent.clone())
    }

    /// Observer of the most recently created transport for `address`.
    pub fn observer(&self, address: SocketAddr) -> Option<TransportObserver> {
        self.with_peer(address, |p| p.observer.clone())
    }
}

struct MockTransport {
    address: SocketAddr,
    peers: Arc<Mutex<HashMap<SocketAddr, PeerState>>>,
}

impl Transport for MockTransport {
    fn connect(&mut self) -> Result<()> {
        let mut peers = self.peers.lock().unwrap();
        peers.entry(self.address).or_default().connects += 1;
        Ok(())
    }

    fn send(&mut self, packet: &[u8]) -> Result<usize> {
        let mut peers = self.peers.lock().unwrap();
        peers
            .entry(self.address)
            .or_default()
            .sent
            .push(packet.to_vec());
        Ok(packet.len())
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        if let Ok(mut peers) = self.peers.lock() {
            if let Some(peer) = peers.get_mut(&self.address) {
                peer.live -= 1;
            }
        }
    }
}

impl TransportFactory for MockFactory {
    fn create(
        &mut self,
        address: SocketAddr,
        kind: TransportKind,
        observer: TransportObserver,
    ) -> Box<dyn Transport> {
        let mut peers = self.peers.lock().unwrap();
        let peer = peers.entry(address).or_default();
        peer.created += 1;
        peer.live += 1;
        peer.kinds.push(kind);
        peer.observer = Some(observer);
        Box::new(MockTransport {
            address,
            peers: self.peers.clone(),
        })
    }
}
