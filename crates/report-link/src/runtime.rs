//! # Report runtime
//!
//! Thread-safe handle around a [`ReportLink`]. The link lives on a single
//! worker thread that multiplexes three inputs with `crossbeam_channel::select!`:
//! control commands, transport notifications and the next timer deadline.
//!
//! After every iteration the worker publishes a [`LinkSnapshot`] through an
//! [`ArcSwap`], so readers never contend with the worker. Inbound frames
//! decoded from the collectors are forwarded to [`ReportRuntime::inbound`].
//!
//! Dropping the runtime shuts the worker down and joins it.

use anyhow::Result;
use arc_swap::ArcSwap;
use bytes::Bytes;
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use quanta::Clock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::ReportLinkConfig;
use crate::ledger::{CorrelationKey, SequenceNumber};
use crate::link::ReportLink;
use crate::net::interface::{ChannelSink, TransportFactory};
use crate::net::socket::SocketTransportFactory;
use crate::protocol::header::ReportFrame;
use crate::scheduler::{Priority, ReportType, Stat};
use crate::stats::LinkSnapshot;
use crate::timer::TimerWheel;

const COMMAND_CAPACITY: usize = 1024;
const INBOUND_CAPACITY: usize = 1024;
/// Upper bound on one idle wait, so a mocked clock still gets polled.
const MAX_IDLE_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    Full,
    Disconnected,
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Full => f.write_str("report queue full"),
            CommandError::Disconnected => f.write_str("report worker stopped"),
        }
    }
}

impl std::error::Error for CommandError {}

/// One report handed to the worker for delivery.
#[derive(Debug, Clone)]
pub struct OutgoingReport {
    pub data: Bytes,
    pub report_type: ReportType,
    pub key: CorrelationKey,
    pub seq: SequenceNumber,
}

enum Command {
    UpdateServers(Vec<SocketAddr>, Priority),
    Send(OutgoingReport),
    Acknowledge(SocketAddr, SequenceNumber),
    SetAlternate(bool),
    ClearServers,
    ResetAll,
    GetStat(ReportType, Option<SocketAddr>, Sender<Option<Stat>>),
    Shutdown,
}

pub struct ReportRuntime {
    commands: Sender<Command>,
    snapshot: Arc<ArcSwap<LinkSnapshot>>,
    inbound: Receiver<(SocketAddr, ReportFrame)>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ReportRuntime {
    /// Starts a runtime over real UDP/TCP sockets.
    pub fn new(config: ReportLinkConfig) -> Result<Self> {
        Self::with_factory(config, Clock::new(), SocketTransportFactory)
    }

    pub fn with_factory<F>(config: ReportLinkConfig, clock: Clock, factory: F) -> Result<Self>
    where
        F: TransportFactory + Send + 'static,
    {
        let (commands, command_rx) = bounded(COMMAND_CAPACITY);
        let (inbound_tx, inbound) = bounded(INBOUND_CAPACITY);
        let snapshot = Arc::new(ArcSwap::from_pointee(LinkSnapshot::default()));
        let published = snapshot.clone();

        let handle = thread::Builder::new()
            .name("report-link-worker".into())
            .spawn(move || {
                let mut link = ReportLink::with_timer_wheel(&config, clock, Box::new(factory));
                link.set_packet_sink(Box::new(ChannelSink::new(inbound_tx)));
                runtime_worker(link, command_rx, published);
            })?;

        Ok(Self {
            commands,
            snapshot,
            inbound,
            handle: Some(handle),
        })
    }

    /// Enqueues a report for delivery. Returns immediately.
    pub fn try_send_report(&self, report: OutgoingReport) -> Result<(), CommandError> {
        match self.commands.try_send(Command::Send(report)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(CommandError::Full),
            Err(TrySendError::Disconnected(_)) => Err(CommandError::Disconnected),
        }
    }

    fn control(&self, command: Command, what: &str) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|e| anyhow::anyhow!("Failed to {}: {}", what, e))
    }

    pub fn update_servers(&self, addresses: Vec<SocketAddr>, priority: Priority) -> Result<()> {
        self.control(Command::UpdateServers(addresses, priority), "update servers")
    }

    pub fn acknowledge(&self, address: SocketAddr, seq: SequenceNumber) -> Result<()> {
        self.control(Command::Acknowledge(address, seq), "acknowledge")
    }

    pub fn set_use_alternate_transport_kind(&self, alternate: bool) -> Result<()> {
        self.control(Command::SetAlternate(alternate), "switch transport kind")
    }

    pub fn clear_servers(&self) -> Result<()> {
        self.control(Command::ClearServers, "clear servers")
    }

    pub fn reset_all(&self) -> Result<()> {
        self.control(Command::ResetAll, "reset")
    }

    /// Asks the worker for counters and waits for the answer.
    pub fn get_stat(
        &self,
        report_type: ReportType,
        address: Option<SocketAddr>,
    ) -> Result<Option<Stat>> {
        let (reply_tx, reply_rx) = bounded(1);
        self.control(Command::GetStat(report_type, address, reply_tx), "query stats")?;
        reply_rx
            .recv()
            .map_err(|e| anyhow::anyhow!("Stat reply lost: {}", e))
    }

    /// Latest state published by the worker.
    pub fn snapshot(&self) -> Arc<LinkSnapshot> {
        self.snapshot.load_full()
    }

    pub fn snapshot_handle(&self) -> Arc<ArcSwap<LinkSnapshot>> {
        self.snapshot.clone()
    }

    /// Frames received from the collectors.
    pub fn inbound(&self) -> &Receiver<(SocketAddr, ReportFrame)> {
        &self.inbound
    }

    pub fn shutdown(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReportRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn runtime_worker(
    mut link: ReportLink<TimerWheel>,
    commands: Receiver<Command>,
    snapshot: Arc<ArcSwap<LinkSnapshot>>,
) {
    let events = link.transport_events();
    info!("report link worker started");

    let mut running = true;
    loop {
        let now = link.now();
        let wait = link
            .next_timer_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
            .map_or(MAX_IDLE_WAIT, |d| d.min(MAX_IDLE_WAIT));

        select! {
            recv(commands) -> msg => match msg {
                Ok(Command::Shutdown) | Err(_) => running = false,
                Ok(command) => apply_command(&mut link, command),
            },
            recv(events) -> event => {
                if let Ok(event) = event {
                    link.handle_transport_event(event);
                }
            },
            default(wait) => {}
        }
        if !running {
            break;
        }

        link.pump_transport_events();
        let fired = link.run_due_timers();
        if fired > 0 {
            debug!(fired, "timers fired");
        }
        snapshot.store(Arc::new(link.snapshot()));
    }

    info!("report link worker stopped");
}

fn apply_command(link: &mut ReportLink<TimerWheel>, command: Command) {
    match command {
        Command::UpdateServers(addresses, priority) => link.update_servers(&addresses, priority),
        Command::Send(report) => {
            let written = link.send(&report.data, report.report_type, report.key, report.seq);
            if written == 0 {
                debug!(key = report.key, seq = report.seq, "no ready link for report");
            }
        }
        Command::Acknowledge(address, seq) => link.acknowledge(address, seq),
        Command::SetAlternate(alternate) => link.set_use_alternate_transport_kind(alternate),
        Command::ClearServers => link.clear_servers(),
        Command::ResetAll => link.reset_all(),
        Command::GetStat(report_type, address, reply) => {
            let _ = reply.send(link.get_stat(report_type, address));
        }
        Command::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::mock::MockFactory;
    use crate::protocol::header::ReportFrameHeader;
    use std::time::Instant;

    fn a(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 7000))
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn report(key: u64, seq: u32) -> OutgoingReport {
        OutgoingReport {
            data: Bytes::from_static(b"report"),
            report_type: ReportType::Counter,
            key,
            seq,
        }
    }

    #[test]
    fn delivers_and_acknowledges_through_worker() {
        let factory = MockFactory::default();
        let (clock, _mock) = Clock::mock();
        let rt = ReportRuntime::with_factory(ReportLinkConfig::default(), clock, factory.clone())
            .unwrap();

        rt.update_servers(vec![a(1)], Priority::Normal).unwrap();
        assert!(wait_for(|| factory.observer(a(1)).is_some()));
        factory.observer(a(1)).unwrap().connected();
        assert!(wait_for(|| rt.snapshot().ready_count() == 1));

        rt.try_send_report(report(1, 10)).unwrap();
        assert!(wait_for(|| factory.sent(a(1)).len() == 1));
        rt.acknowledge(a(1), 10).unwrap();

        let stat = rt.get_stat(ReportType::Counter, None).unwrap().unwrap();
        assert_eq!(stat.valid_sent, 1);
        assert_eq!(stat.valid_received, 1);
    }

    #[test]
    fn inbound_frames_are_forwarded() {
        let factory = MockFactory::default();
        let (clock, _mock) = Clock::mock();
        let rt = ReportRuntime::with_factory(ReportLinkConfig::default(), clock, factory.clone())
            .unwrap();
        rt.update_servers(vec![a(1)], Priority::Normal).unwrap();
        assert!(wait_for(|| factory.observer(a(1)).is_some()));

        let wire = ReportFrameHeader::new(3, 42, 2).unwrap().wrap(b"hi");
        factory.observer(a(1)).unwrap().data(wire);
        let (from, frame) = rt.inbound().recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(from, a(1));
        assert_eq!(frame.header.message_id, 42);
    }

    #[test]
    fn send_after_shutdown_is_disconnected() {
        let (clock, _mock) = Clock::mock();
        let mut rt =
            ReportRuntime::with_factory(ReportLinkConfig::default(), clock, MockFactory::default())
                .unwrap();
        rt.shutdown();
        assert_eq!(rt.try_send_report(report(1, 1)), Err(CommandError::Disconnected));
        assert!(rt.get_stat(ReportType::All, None).is_err());
    }
}
