//! Shared in-memory transport for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use report_link::net::interface::{Transport, TransportFactory, TransportKind, TransportObserver};

pub fn addr(n: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, n], 7000))
}

#[derive(Default)]
struct Peer {
    created: usize,
    live: usize,
    kind: Option<TransportKind>,
    sent: Vec<Vec<u8>>,
    observer: Option<TransportObserver>,
}

/// Records what the link layer does with each collector address and hands
/// out the observers so tests can play the transport's side.
#[derive(Clone, Default)]
pub struct FakeNetwork {
    peers: Arc<Mutex<HashMap<SocketAddr, Peer>>>,
}

impl FakeNetwork {
    fn peer<T>(&self, address: SocketAddr, f: impl FnOnce(&Peer) -> T) -> T {
        let peers = self.peers.lock().unwrap();
        let empty = Peer::default();
        f(peers.get(&address).unwrap_or(&empty))
    }

    pub fn created(&self, address: SocketAddr) -> usize {
        self.peer(address, |p| p.created)
    }

    pub fn is_live(&self, address: SocketAddr) -> bool {
        self.peer(address, |p| p.live > 0)
    }

    pub fn total_live(&self) -> usize {
        self.peers.lock().unwrap().values().map(|p| p.live).sum()
    }

    pub fn kind(&self, address: SocketAddr) -> Option<TransportKind> {
        self.peer(address, |p| p.kind)
    }

    pub fn sent(&self, address: SocketAddr) -> usize {
        self.peer(address, |p| p.sent.len())
    }

    pub fn observer(&self, address: SocketAddr) -> Option<TransportObserver> {
        self.peer(address, |p| p.observer.clone())
    }

    pub fn connect(&self, address: SocketAddr) {
        self.observer(address)
            .expect("no transport created for address")
            .connected();
    }
}

struct FakeTransport {
    address: SocketAddr,
    peers: Arc<Mutex<HashMap<SocketAddr, Peer>>>,
}

impl Transport for FakeTransport {
    fn connect(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn send(&mut self, packet: &[u8]) -> anyhow::Result<usize> {
        let mut peers = self.peers.lock().unwrap();
        peers
            .entry(self.address)
            .or_default()
            .sent
            .push(packet.to_vec());
        Ok(packet.len())
    }
}

impl Drop for FakeTransport {
    fn drop(&mut self) {
        if let Ok(mut peers) = self.peers.lock() {
            if let Some(peer) = peers.get_mut(&self.address) {
                peer.live -= 1;
            }
        }
    }
}

impl TransportFactory for FakeNetwork {
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
        peer.kind = Some(kind);
        peer.observer = Some(observer);
        Box::new(FakeTransport {
            address,
            peers: self.peers.clone(),
        })
    }
}
