use anyhow::Result;
use bytes::Bytes;
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

use crate::protocol::header::ReportFrame;

/// Socket flavour used when a transport is opened towards a collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Primary kind: datagram transport.
    #[default]
    Udp,
    /// Alternate kind: stream transport, used where datagrams are filtered.
    Tcp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "udp" => Some(TransportKind::Udp),
            "tcp" => Some(TransportKind::Tcp),
            _ => None,
        }
    }
}

/// Failures a link can report or be charged with.
///
/// None of these surface to callers of the facade; they only change which
/// links are selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFault {
    /// Socket creation or connect failed.
    TransportConnect(String),
    /// The underlying network interface changed and the socket must rebind.
    TransportChanged,
    /// No successful handshake within the connect timeout.
    ConnectionTimeout,
}

impl fmt::Display for LinkFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkFault::TransportConnect(reason) => write!(f, "transport connect error: {}", reason),
            LinkFault::TransportChanged => f.write_str("transport changed"),
            LinkFault::ConnectionTimeout => f.write_str("connection timeout"),
        }
    }
}

/// What a transport reported back to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    Connected,
    Fault(LinkFault),
    Data(Bytes),
}

/// A transport notification tagged with the server and transport generation
/// it belongs to. Events from a generation that has since been torn down are
/// ignored by the selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub address: SocketAddr,
    pub generation: u64,
    pub kind: TransportEventKind,
}

/// Callback capability handed to every transport at creation.
///
/// The transport never sees its owner; it can only push events into the
/// engine's event queue. Safe to clone into I/O helper threads.
#[derive(Debug, Clone)]
pub struct TransportObserver {
    address: SocketAddr,
    generation: u64,
    events: Sender<TransportEvent>,
}

impl TransportObserver {
    pub fn new(address: SocketAddr, generation: u64, events: Sender<TransportEvent>) -> Self {
        Self {
            address,
            generation,
            events,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn emit(&self, kind: TransportEventKind) {
        // The engine may already be gone during shutdown.
        let _ = self.events.send(TransportEvent {
            address: self.address,
            generation: self.generation,
            kind,
        });
    }

    pub fn connected(&self) {
        self.emit(TransportEventKind::Connected);
    }

    pub fn error(&self, reason: impl Into<String>) {
        self.emit(TransportEventKind::Fault(LinkFault::TransportConnect(
            reason.into(),
        )));
    }

    pub fn changed(&self) {
        self.emit(TransportEventKind::Fault(LinkFault::TransportChanged));
    }

    pub fn data(&self, bytes: Bytes) {
        self.emit(TransportEventKind::Data(bytes));
    }
}

/// A connection towards one collector server.
///
/// Dropping the transport destroys it; implementations must stop reporting
/// events soon after drop, and any late event is discarded by generation.
pub trait Transport {
    /// Starts connecting. Completion is reported through the observer.
    fn connect(&mut self) -> Result<()>;
    /// Writes one frame. Returns the number of bytes written.
    fn send(&mut self, packet: &[u8]) -> Result<usize>;
}

/// Creates transports on behalf of the selector.
pub trait TransportFactory {
    fn create(
        &mut self,
        address: SocketAddr,
        kind: TransportKind,
        observer: TransportObserver,
    ) -> Box<dyn Transport>;
}

/// Receives inbound frames from collector servers.
pub trait PacketSink {
    fn deliver(&mut self, from: SocketAddr, frame: ReportFrame);
}

/// [`PacketSink`] forwarding frames into a channel.
pub struct ChannelSink {
    tx: Sender<(SocketAddr, ReportFrame)>,
}

impl ChannelSink {
    pub fn new(tx: Sender<(SocketAddr, ReportFrame)>) -> Self {
        Self { tx }
    }
}

impl PacketSink for ChannelSink {
    fn deliver(&mut self, from: SocketAddr, frame: ReportFrame) {
        if self.tx.try_send((from, frame)).is_err() {
            tracing::debug!(%from, "inbound frame dropped, sink full or closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn transport_kind_names() {
        assert_eq!(TransportKind::Udp.as_str(), "udp");
        assert_eq!(TransportKind::from_name("TCP"), Some(TransportKind::Tcp));
        assert_eq!(TransportKind::from_name("quic"), None);
        assert_eq!(TransportKind::default(), TransportKind::Udp);
    }

    #[test]
    fn observer_tags_events() {
        let (tx, rx) = unbounded();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let observer = TransportObserver::new(addr, 7, tx);

        observer.connected();
        observer.changed();
        observer.error("refused");
        observer.data(Bytes::from_static(b"x"));

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 4);
        assert!(events.iter().all(|e| e.address == addr && e.generation == 7));
        assert_eq!(events[0].kind, TransportEventKind::Connected);
        assert_eq!(
            events[1].kind,
            TransportEventKind::Fault(LinkFault::TransportChanged)
        );
        assert_eq!(
            events[2].kind,
            TransportEventKind::Fault(LinkFault::TransportConnect("refused".into()))
        );
        assert_eq!(
            events[3].kind,
            TransportEventKind::Data(Bytes::from_static(b"x"))
        );
    }

    #[test]
    fn observer_survives_closed_queue() {
        let (tx, rx) = unbounded();
        drop(rx);
        let observer = TransportObserver::new("127.0.0.1:9000".parse().unwrap(), 1, tx);
        observer.connected();
    }

    #[test]
    fn fault_display() {
        assert_eq!(
            LinkFault::TransportConnect("refused".into()).to_string(),
            "transport connect error: refused"
        );
        assert_eq!(LinkFault::ConnectionTimeout.to_string(), "connection timeout");
    }
}
