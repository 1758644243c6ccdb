//! # Socket transports
//!
//! Concrete [`Transport`]s over std sockets. UDP is the primary kind: the
//! socket is "connected" as soon as it is bound and associated with the
//! collector address. TCP is the alternate kind: the handshake runs on a
//! helper thread so `connect()` never blocks the engine.
//!
//! Reader threads push inbound frames and failures through the
//! [`TransportObserver`]; they exit shortly after the transport is dropped.
//! A failure inside `connect()` itself is only returned, never also
//! reported, so the attempt stays pending until supervision degrades it.

use anyhow::Result;
use bytes::Bytes;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::net::interface::{Transport, TransportFactory, TransportKind, TransportObserver};
use crate::protocol::header::FrameAssembler;

const READ_POLL: Duration = Duration::from_millis(200);
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_DATAGRAM: usize = 64 * 1024;

/// Creates UDP or TCP transports depending on the requested kind.
#[derive(Debug, Default, Clone)]
pub struct SocketTransportFactory;

impl TransportFactory for SocketTransportFactory {
    fn create(
        &mut self,
        address: SocketAddr,
        kind: TransportKind,
        observer: TransportObserver,
    ) -> Box<dyn Transport> {
        match kind {
            TransportKind::Udp => Box::new(UdpTransport::new(address, observer)),
            TransportKind::Tcp => Box::new(TcpTransport::new(address, observer)),
        }
    }
}

fn unspecified_for(address: &SocketAddr) -> SocketAddr {
    if address.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    }
}

fn report_io_error(observer: &TransportObserver, error: &std::io::Error) {
    if error.kind() == ErrorKind::AddrNotAvailable {
        observer.changed();
    } else {
        observer.error(error.to_string());
    }
}

fn is_poll_timeout(error: &std::io::Error) -> bool {
    matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

pub struct UdpTransport {
    address: SocketAddr,
    observer: TransportObserver,
    socket: Option<UdpSocket>,
    stop: Arc<AtomicBool>,
}

impl UdpTransport {
    pub fn new(address: SocketAddr, observer: TransportObserver) -> Self {
        Self {
            address,
            observer,
            socket: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    fn open(&self) -> std::io::Result<UdpSocket> {
        let socket = UdpSocket::bind(unspecified_for(&self.address))?;
        socket.connect(self.address)?;
        socket.set_read_timeout(Some(READ_POLL))?;
        Ok(socket)
    }
}

impl Transport for UdpTransport {
    fn connect(&mut self) -> Result<()> {
        let socket = self.open()?;
        let reader = socket.try_clone()?;
        let observer = self.observer.clone();
        let stop = self.stop.clone();
        thread::Builder::new()
            .name(format!("report-udp-{}", self.address))
            .spawn(move || {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                while !stop.load(Ordering::Relaxed) {
                    match reader.recv(&mut buf) {
                        Ok(n) => observer.data(Bytes::copy_from_slice(&buf[..n])),
                        Err(e) if is_poll_timeout(&e) => {}
                        Err(e) => {
                            if !stop.load(Ordering::Relaxed) {
                                report_io_error(&observer, &e);
                            }
                            break;
                        }
                    }
                }
            })?;

        self.socket = Some(socket);
        self.observer.connected();
        Ok(())
    }

    fn send(&mut self, packet: &[u8]) -> Result<usize> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("udp transport to {} not open", self.address))?;
        Ok(socket.send(packet)?)
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

pub struct TcpTransport {
    address: SocketAddr,
    observer: TransportObserver,
    stream: Arc<Mutex<Option<TcpStream>>>,
    stop: Arc<AtomicBool>,
}

impl TcpTransport {
    pub fn new(address: SocketAddr, observer: TransportObserver) -> Self {
        Self {
            address,
            observer,
            stream: Arc::new(Mutex::new(None)),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }
}

fn tcp_session(
    address: SocketAddr,
    observer: TransportObserver,
    slot: Arc<Mutex<Option<TcpStream>>>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<()> {
    let stream = TcpStream::connect_timeout(&address, TCP_CONNECT_TIMEOUT)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(READ_POLL))?;
    let mut reader = stream.try_clone()?;
    if stop.load(Ordering::Relaxed) {
        return Ok(());
    }
    if let Ok(mut guard) = slot.lock() {
        *guard = Some(stream);
    }
    observer.connected();

    let mut assembler = FrameAssembler::new();
    let mut buf = [0u8; 4096];
    while !stop.load(Ordering::Relaxed) {
        match reader.read(&mut buf) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    ErrorKind::ConnectionReset,
                    "collector closed the stream",
                ))
            }
            Ok(n) => {
                assembler.extend(&buf[..n]);
                loop {
                    match assembler.next_frame() {
                        Ok(Some(frame)) => observer.data(frame),
                        Ok(None) => break,
                        Err(dropped) => {
                            tracing::debug!(%address, dropped, "unframed stream bytes dropped");
                            break;
                        }
                    }
                }
            }
            Err(e) if is_poll_timeout(&e) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

impl Transport for TcpTransport {
    fn connect(&mut self) -> Result<()> {
        let address = self.address;
        let observer = self.observer.clone();
        let slot = self.stream.clone();
        let stop = self.stop.clone();
        thread::Builder::new()
            .name(format!("report-tcp-{}", address))
            .spawn(move || {
                if let Err(e) = tcp_session(address, observer.clone(), slot, stop.clone()) {
                    if !stop.load(Ordering::Relaxed) {
                        report_io_error(&observer, &e);
                    }
                }
            })?;
        Ok(())
    }

    fn send(&mut self, packet: &[u8]) -> Result<usize> {
        let mut guard = self
            .stream
            .lock()
            .map_err(|_| anyhow::anyhow!("tcp stream lock poisoned"))?;
        let stream = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("tcp transport to {} not connected", self.address))?;
        stream.write_all(packet)?;
        Ok(packet.len())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Ok(guard) = self.stream.lock() {
            if let Some(stream) = guard.as_ref() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}
