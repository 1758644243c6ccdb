use anyhow::Result;
use crossbeam_channel::Sender;
use quanta::Instant;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::net::interface::{
    Transport, TransportEvent, TransportFactory, TransportKind, TransportObserver,
};
use crate::scheduler::{rank, Priority, Quality, Stat};

/// Opens transports of the currently selected kind, wiring each one to the
/// engine's event queue through a fresh [`TransportObserver`].
pub struct TransportSpawner {
    factory: Box<dyn TransportFactory>,
    kind: TransportKind,
    events: Sender<TransportEvent>,
}

impl TransportSpawner {
    pub fn new(
        factory: Box<dyn TransportFactory>,
        kind: TransportKind,
        events: Sender<TransportEvent>,
    ) -> Self {
        Self {
            factory,
            kind,
            events,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: TransportKind) {
        self.kind = kind;
    }

    fn open(&mut self, address: SocketAddr, generation: u64) -> Box<dyn Transport> {
        let observer = TransportObserver::new(address, generation, self.events.clone());
        self.factory.create(address, self.kind, observer)
    }
}

/// One known collector endpoint and its connection/quality state.
///
/// The record outlives any number of transports: reconnecting replaces the
/// transport and bumps the generation, nothing else.
pub struct CandidateServer {
    address: SocketAddr,
    priority: Priority,
    quality: Quality,
    /// Stat the current grade was derived from.
    baseline: Stat,
    /// Stat observed at the previous reclassification tick.
    previous_sample: Stat,
    transport: Option<Box<dyn Transport>>,
    connected: bool,
    connect_started: Option<Instant>,
    generation: u64,
}

impl CandidateServer {
    pub fn new(address: SocketAddr, priority: Priority) -> Self {
        Self {
            address,
            priority,
            quality: Quality::default(),
            baseline: Stat::default(),
            previous_sample: Stat::default(),
            transport: None,
            connected: false,
            connect_started: None,
            generation: 0,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn quality(&self) -> Quality {
        self.quality
    }

    pub fn rank(&self) -> u8 {
        rank(self.priority, self.quality)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connect_started(&self) -> Option<Instant> {
        self.connect_started
    }

    /// Raises the priority. Returns false when `priority` is not higher.
    pub fn promote(&mut self, priority: Priority) -> bool {
        if priority > self.priority {
            self.priority = priority;
            true
        } else {
            false
        }
    }

    pub fn set_quality(&mut self, quality: Quality) {
        self.quality = quality;
    }

    pub fn baseline(&self) -> &Stat {
        &self.baseline
    }

    pub fn set_baseline(&mut self, stat: Stat) {
        self.baseline = stat;
    }

    /// Records `sample` as the latest observation. Returns true when it
    /// differs from the previous one.
    pub fn observe_sample(&mut self, sample: Stat) -> bool {
        let changed = sample != self.previous_sample;
        self.previous_sample = sample;
        changed
    }

    pub fn is_activated(&self) -> bool {
        self.transport.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.transport.is_some() && self.connected
    }

    /// Creates a transport and starts connecting. Returns false if a
    /// transport already exists.
    pub fn activate(&mut self, spawner: &mut TransportSpawner, now: Instant) -> bool {
        if self.transport.is_some() {
            return false;
        }
        self.generation += 1;
        let mut transport = spawner.open(self.address, self.generation);
        self.connected = false;
        self.connect_started = Some(now);
        if let Err(e) = transport.connect() {
            // Left pending; connection supervision will degrade it.
            warn!(address = %self.address, error = %e, "transport connect failed");
        }
        self.transport = Some(transport);
        debug!(
            address = %self.address,
            generation = self.generation,
            kind = spawner.kind().as_str(),
            "server activated"
        );
        true
    }

    /// Destroys the transport. Returns false if there was none.
    pub fn deactivate(&mut self) -> bool {
        let had_transport = self.transport.take().is_some();
        self.connected = false;
        self.connect_started = None;
        if had_transport {
            debug!(address = %self.address, "server deactivated");
        }
        had_transport
    }

    /// Tears down the transport and immediately starts a new attempt.
    pub fn reconnect(&mut self, spawner: &mut TransportSpawner, now: Instant) {
        self.deactivate();
        self.activate(spawner, now);
    }

    /// Handles a connected notification. Returns false for stale generations.
    pub fn mark_connected(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.transport.is_none() {
            return false;
        }
        self.connected = true;
        self.connect_started = None;
        true
    }

    /// Degrades the server to the worst grade once the connect attempt has
    /// been pending longer than `timeout`. Does not retry the handshake.
    pub fn check_connection_timed_out(&mut self, now: Instant, timeout: Duration) -> bool {
        let Some(started) = self.connect_started else {
            return false;
        };
        if now.saturating_duration_since(started) > timeout {
            self.quality = Quality::WORST;
            true
        } else {
            false
        }
    }

    pub fn send(&mut self, packet: &[u8]) -> Result<usize> {
        match self.transport.as_mut() {
            Some(transport) if self.connected => transport.send(packet),
            _ => Err(anyhow::anyhow!("server {} not ready", self.address)),
        }
    }

    /// Restores the default grade and forgets all stat history.
    pub fn reset(&mut self) {
        self.quality = Quality::default();
        self.baseline = Stat::default();
        self.previous_sample = Stat::default();
        self.connect_started = None;
    }
}
