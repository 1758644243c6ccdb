//! The facade the outer protocol layer talks to.
//!
//! [`ReportLink`] composes the [`LinkSelector`] and the [`DeliveryLedger`]
//! on a single thread. Every method runs to completion without blocking;
//! transport notifications arrive through an internal queue and timers
//! through the injected [`Scheduler`].

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver};
use quanta::{Clock, Instant};
use std::net::SocketAddr;
use tracing::{debug, trace};

use crate::config::ReportLinkConfig;
use crate::ledger::{CorrelationKey, DeliveryLedger, SequenceNumber};
use crate::net::interface::{
    PacketSink, TransportEvent, TransportEventKind, TransportFactory, TransportKind,
};
use crate::protocol::header::ReportFrameHeader;
use crate::scheduler::classifier::QualityClassifier;
use crate::scheduler::selector::LinkSelector;
use crate::scheduler::{Priority, ReportType, Stat};
use crate::stats::{LinkSnapshot, ServerSnapshot, SNAPSHOT_SCHEMA_VERSION};
use crate::timer::{Scheduler, TimerKind, TimerWheel};

pub struct ReportLink<S: Scheduler> {
    clock: Clock,
    scheduler: S,
    selector: LinkSelector,
    ledger: DeliveryLedger,
    events: Receiver<TransportEvent>,
    sink: Option<Box<dyn PacketSink>>,
}

impl<S: Scheduler> ReportLink<S> {
    pub fn new(
        config: &ReportLinkConfig,
        clock: Clock,
        scheduler: S,
        factory: Box<dyn TransportFactory>,
    ) -> Self {
        let (events_tx, events) = unbounded();
        let selector = LinkSelector::new(
            factory,
            config.transport,
            events_tx,
            &config.timers,
            &config.classifier,
        );
        let mut link = Self {
            clock,
            scheduler,
            selector,
            ledger: DeliveryLedger::new(&config.timers),
            events,
            sink: None,
        };
        for server in &config.servers {
            link.update_servers(&[server.address], server.priority);
        }
        link
    }

    pub fn set_classifier(&mut self, classifier: Box<dyn QualityClassifier>) {
        self.selector.set_classifier(classifier);
    }

    pub fn set_packet_sink(&mut self, sink: Box<dyn PacketSink>) {
        self.sink = Some(sink);
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn selector(&self) -> &LinkSelector {
        &self.selector
    }

    pub fn ledger(&self) -> &DeliveryLedger {
        &self.ledger
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// Queue of transport notifications, for callers that multiplex it with
    /// their own channels. Drained by [`ReportLink::pump_transport_events`].
    pub fn transport_events(&self) -> Receiver<TransportEvent> {
        self.events.clone()
    }

    pub fn update_servers(&mut self, addresses: &[SocketAddr], priority: Priority) {
        let now = self.clock.now();
        self.selector.add_or_promote(&mut self.scheduler, addresses, priority, now);
    }

    /// Writes `data` to the ready links chosen by aggregate quality and
    /// records each successful write in the ledger. Returns the total
    /// number of bytes written across links; 0 when no link is ready.
    pub fn send(
        &mut self,
        data: &[u8],
        report_type: ReportType,
        key: CorrelationKey,
        seq: SequenceNumber,
    ) -> usize {
        let now = self.clock.now();
        let aggregate = self.selector.overall_quality();
        let mut written = 0;
        let mut delivered_to = Vec::new();

        for server in self.selector.ready_transports(aggregate) {
            match server.send(data) {
                Ok(n) => {
                    written += n;
                    delivered_to.push(server.address());
                }
                Err(e) => {
                    debug!(address = %server.address(), error = %e, "report write failed");
                }
            }
        }

        for address in delivered_to {
            self.ledger.on_send(&mut self.scheduler, address, report_type, key, seq, now);
        }
        self.selector.arm_stat_timer(&mut self.scheduler);
        trace!(key, seq, written, "report sent");
        written
    }

    pub fn acknowledge(&mut self, address: SocketAddr, seq: SequenceNumber) {
        if !self.ledger.on_receive(&mut self.scheduler, address, seq) {
            trace!(%address, seq, "acknowledgement did not resolve");
        }
        self.selector.arm_stat_timer(&mut self.scheduler);
    }

    pub fn get_stat(&self, report_type: ReportType, address: Option<SocketAddr>) -> Option<Stat> {
        self.ledger.get_stat(report_type, address)
    }

    /// Deactivates and resets every server, stops all timers and clears the
    /// ledger. Servers stay registered and reconnect on the next update.
    pub fn reset_all(&mut self) {
        self.selector.reset_all();
        self.ledger.clear();
    }

    pub fn clear_servers(&mut self) {
        self.selector.clear_servers();
    }

    pub fn set_use_alternate_transport_kind(&mut self, alternate: bool) {
        let kind = if alternate {
            TransportKind::Tcp
        } else {
            TransportKind::Udp
        };
        let now = self.clock.now();
        self.selector.set_transport_kind(&mut self.scheduler, kind, now);
    }

    /// Dispatches one timer firing.
    pub fn on_timer(&mut self, kind: TimerKind) {
        let now = self.clock.now();
        match kind {
            TimerKind::Reclassify => {
                self.selector.on_stat_timer(&mut self.scheduler, &self.ledger, now);
            }
            TimerKind::ConnectionSupervision => {
                self.selector.on_connection_supervision_timer(&mut self.scheduler, now);
            }
            TimerKind::Sweep => {
                let evicted = self.ledger.sweep(now);
                if evicted > 0 {
                    debug!(evicted, "correlation records swept");
                }
            }
        }
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event.kind {
            TransportEventKind::Connected => {
                self.selector.on_connected(event.address, event.generation);
            }
            TransportEventKind::Fault(fault) => {
                let now = self.clock.now();
                self.selector.on_transport_fault(
                    &mut self.scheduler,
                    event.address,
                    event.generation,
                    &fault,
                    now,
                );
            }
            TransportEventKind::Data(bytes) => self.deliver(event.address, bytes),
        }
    }

    /// Handles the transport notifications queued at entry. Returns how many.
    ///
    /// Handling a fault rebuilds the transport, which may queue a new fault;
    /// those wait for the next call.
    pub fn pump_transport_events(&mut self) -> usize {
        let batch = self.events.len();
        let mut handled = 0;
        while handled < batch {
            let Ok(event) = self.events.try_recv() else {
                break;
            };
            self.handle_transport_event(event);
            handled += 1;
        }
        handled
    }

    fn deliver(&mut self, from: SocketAddr, bytes: Bytes) {
        let Some(frame) = ReportFrameHeader::decode(bytes) else {
            debug!(%from, "malformed inbound frame dropped");
            return;
        };
        match self.sink.as_mut() {
            Some(sink) => sink.deliver(from, frame),
            None => trace!(%from, "no packet sink, inbound frame dropped"),
        }
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        let servers = self
            .selector
            .servers()
            .iter()
            .map(|s| ServerSnapshot {
                address: s.address().to_string(),
                priority: s.priority(),
                quality: s.quality(),
                rank: s.rank(),
                activated: s.is_activated(),
                ready: s.is_ready(),
                stat: self.ledger.get_stat(ReportType::All, Some(s.address())),
            })
            .collect();
        LinkSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            transport: self.selector.transport_kind(),
            aggregate_quality: self.selector.overall_quality(),
            aggregate: self.ledger.get_stat(ReportType::All, None),
            outstanding: self.ledger.aggregate().record_count(),
            servers,
        }
    }
}

impl ReportLink<TimerWheel> {
    /// Builds a link driven by a [`TimerWheel`] on the same clock.
    pub fn with_timer_wheel(
        config: &ReportLinkConfig,
        clock: Clock,
        factory: Box<dyn TransportFactory>,
    ) -> Self {
        let wheel = TimerWheel::new(clock.clone());
        Self::new(config, clock, wheel, factory)
    }

    /// Fires every timer that is due. Returns the number of firings.
    pub fn run_due_timers(&mut self) -> usize {
        let now = self.clock.now();
        let mut fired = 0;
        while let Some(kind) = self.scheduler.next_due(now) {
            self.on_timer(kind);
            fired += 1;
        }
        fired
    }

    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }
}
