use crossbeam_channel::Sender;
use quanta::Instant;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{ClassifierConfig, TimerConfig};
use crate::ledger::DeliveryLedger;
use crate::net::interface::{LinkFault, TransportEvent, TransportFactory, TransportKind};
use crate::net::server::{CandidateServer, TransportSpawner};
use crate::scheduler::classifier::{LossRatioClassifier, QualityClassifier};
use crate::scheduler::{Priority, Quality, ReportType, Stat, MAX_ACTIVE_LINKS};
use crate::timer::{Scheduler, TimerHandle, TimerKind};

/// Owns every [`CandidateServer`], keeps them ranked, and bounds the number
/// of live transports to [`MAX_ACTIVE_LINKS`].
pub struct LinkSelector {
    /// Kept in rank order after every resort.
    servers: Vec<CandidateServer>,
    spawner: TransportSpawner,
    classifier: Box<dyn QualityClassifier>,
    overall_quality: Quality,
    overall_baseline: Stat,
    overall_previous: Stat,
    connect_timeout: Duration,
    reclassify_interval: Duration,
    supervision_interval: Duration,
    stat_timer: Option<TimerHandle>,
    supervision_timer: Option<TimerHandle>,
}

impl LinkSelector {
    pub fn new(
        factory: Box<dyn TransportFactory>,
        kind: TransportKind,
        events: Sender<TransportEvent>,
        timers: &TimerConfig,
        classifier: &ClassifierConfig,
    ) -> Self {
        Self {
            servers: Vec::new(),
            spawner: TransportSpawner::new(factory, kind, events),
            classifier: Box::new(LossRatioClassifier::new(classifier.clone())),
            overall_quality: Quality::default(),
            overall_baseline: Stat::default(),
            overall_previous: Stat::default(),
            connect_timeout: timers.connect_timeout,
            reclassify_interval: timers.reclassify_interval,
            supervision_interval: timers.supervision_interval,
            stat_timer: None,
            supervision_timer: None,
        }
    }

    pub fn set_classifier(&mut self, classifier: Box<dyn QualityClassifier>) {
        self.classifier = classifier;
    }

    pub fn servers(&self) -> &[CandidateServer] {
        &self.servers
    }

    pub fn server(&self, address: SocketAddr) -> Option<&CandidateServer> {
        self.servers.iter().find(|s| s.address() == address)
    }

    pub fn overall_quality(&self) -> Quality {
        self.overall_quality
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.spawner.kind()
    }

    pub fn active_count(&self) -> usize {
        self.servers.iter().filter(|s| s.is_activated()).count()
    }

    pub fn is_stat_timer_armed(&self) -> bool {
        self.stat_timer.is_some()
    }

    pub fn is_supervision_armed(&self) -> bool {
        self.supervision_timer.is_some()
    }

    /// Adds unknown addresses at `priority` and raises the priority of known
    /// ones, then resorts.
    pub fn add_or_promote(
        &mut self,
        scheduler: &mut dyn Scheduler,
        addresses: &[SocketAddr],
        priority: Priority,
        now: Instant,
    ) {
        for &address in addresses {
            match self.servers.iter_mut().find(|s| s.address() == address) {
                Some(server) => {
                    if server.promote(priority) {
                        debug!(%address, priority = ?priority, "server promoted");
                    }
                }
                None => {
                    info!(%address, priority = ?priority, "server added");
                    self.servers.push(CandidateServer::new(address, priority));
                }
            }
        }
        self.resort(scheduler, now);
    }

    /// Stable-sorts by rank and keeps exactly the top servers activated.
    pub fn resort(&mut self, scheduler: &mut dyn Scheduler, now: Instant) {
        self.servers.sort_by(|a, b| b.rank().cmp(&a.rank()));

        // Release surplus transports before opening new ones so the ceiling
        // holds at every step.
        for server in self.servers.iter_mut().skip(MAX_ACTIVE_LINKS) {
            server.deactivate();
        }
        let mut activated = false;
        for server in self.servers.iter_mut().take(MAX_ACTIVE_LINKS) {
            activated |= server.activate(&mut self.spawner, now);
        }

        if activated {
            self.arm_supervision(scheduler);
        }
    }

    /// Ready servers in rank order, limited by the aggregate quality: one
    /// link while the aggregate is Good or better, two otherwise.
    pub fn ready_transports(&mut self, aggregate: Quality) -> Vec<&mut CandidateServer> {
        let fan_out = if aggregate.is_at_least(Quality::Good) {
            1
        } else {
            MAX_ACTIVE_LINKS
        };
        self.servers
            .iter_mut()
            .filter(|s| s.is_ready())
            .take(fan_out)
            .collect()
    }

    pub fn ready_addresses(&self, aggregate: Quality) -> Vec<SocketAddr> {
        let fan_out = if aggregate.is_at_least(Quality::Good) {
            1
        } else {
            MAX_ACTIVE_LINKS
        };
        self.servers
            .iter()
            .filter(|s| s.is_ready())
            .take(fan_out)
            .map(|s| s.address())
            .collect()
    }

    /// Arms the reclassification timer if it was stopped.
    pub fn arm_stat_timer(&mut self, scheduler: &mut dyn Scheduler) {
        if self.stat_timer.is_none() {
            self.stat_timer =
                Some(scheduler.schedule(TimerKind::Reclassify, self.reclassify_interval));
        }
    }

    fn arm_supervision(&mut self, scheduler: &mut dyn Scheduler) {
        if self.supervision_timer.is_none() {
            self.supervision_timer = Some(
                scheduler.schedule(TimerKind::ConnectionSupervision, self.supervision_interval),
            );
        }
    }

    /// Reclassifies every server and the aggregate from the ledger. Stops
    /// the timer when nothing moved since the previous tick.
    pub fn on_stat_timer(
        &mut self,
        scheduler: &mut dyn Scheduler,
        ledger: &DeliveryLedger,
        now: Instant,
    ) {
        let mut any_changed = false;

        for server in &mut self.servers {
            let Some(current) = ledger.get_stat(ReportType::All, Some(server.address())) else {
                continue;
            };
            any_changed |= server.observe_sample(current);
            if let Some(grade) = self
                .classifier
                .classify(server.baseline(), &current, server.quality())
            {
                info!(
                    address = %server.address(),
                    from = server.quality().as_str(),
                    to = grade.as_str(),
                    "server quality changed"
                );
                server.set_quality(grade);
                server.set_baseline(current);
            }
        }

        if let Some(current) = ledger.get_stat(ReportType::All, None) {
            if current != self.overall_previous {
                any_changed = true;
                self.overall_previous = current;
            }
            let verdict = self
                .classifier
                .classify(&self.overall_baseline, &current, self.overall_quality);
            if let Some(grade) = verdict {
                info!(
                    from = self.overall_quality.as_str(),
                    to = grade.as_str(),
                    "aggregate quality changed"
                );
                self.overall_quality = grade;
                self.overall_baseline = current;
            }
        }

        if any_changed {
            self.resort(scheduler, now);
        } else if self.stat_timer.take().is_some() {
            debug!("no delivery activity, reclassify timer stopped");
        }
    }

    /// Degrades servers whose connect attempt overran the timeout. Keeps
    /// running while any activated server is still not ready.
    pub fn on_connection_supervision_timer(&mut self, scheduler: &mut dyn Scheduler, now: Instant) {
        let mut timed_out = false;
        for server in &mut self.servers {
            if server.is_activated() && !server.is_ready() {
                let before = server.quality();
                if server.check_connection_timed_out(now, self.connect_timeout) {
                    timed_out = true;
                    if before != Quality::WORST {
                        warn!(
                            address = %server.address(),
                            fault = %LinkFault::ConnectionTimeout,
                            "server degraded"
                        );
                    }
                }
            }
        }
        if timed_out {
            self.resort(scheduler, now);
        }

        let pending = self
            .servers
            .iter()
            .any(|s| s.is_activated() && !s.is_ready());
        if pending {
            self.arm_supervision(scheduler);
        } else {
            self.supervision_timer = None;
        }
    }

    /// Applies a connected notification. Returns false for unknown servers
    /// and stale transport generations.
    pub fn on_connected(&mut self, address: SocketAddr, generation: u64) -> bool {
        let Some(server) = self.servers.iter_mut().find(|s| s.address() == address) else {
            return false;
        };
        let fresh = server.mark_connected(generation);
        if fresh {
            info!(%address, generation, "server connected");
        }
        fresh
    }

    /// Rebuilds the transport of a server that reported a fault. No backoff:
    /// redundancy across servers absorbs a flapping link.
    pub fn on_transport_fault(
        &mut self,
        scheduler: &mut dyn Scheduler,
        address: SocketAddr,
        generation: u64,
        fault: &LinkFault,
        now: Instant,
    ) -> bool {
        let Some(server) = self.servers.iter_mut().find(|s| s.address() == address) else {
            return false;
        };
        if server.generation() != generation || !server.is_activated() {
            debug!(%address, generation, "stale transport fault ignored");
            return false;
        }
        warn!(%address, fault = %fault, "transport fault, reconnecting");
        server.reconnect(&mut self.spawner, now);
        self.arm_supervision(scheduler);
        true
    }

    /// Switches the transport kind and reconnects the active servers with it.
    pub fn set_transport_kind(
        &mut self,
        scheduler: &mut dyn Scheduler,
        kind: TransportKind,
        now: Instant,
    ) {
        if self.spawner.kind() == kind {
            return;
        }
        info!(kind = kind.as_str(), "transport kind changed");
        self.spawner.set_kind(kind);
        for server in &mut self.servers {
            server.deactivate();
        }
        self.resort(scheduler, now);
    }

    /// Deactivates and resets every server and stops the owned timers.
    /// Servers stay known; they reconnect on the next resort.
    pub fn reset_all(&mut self) {
        for server in &mut self.servers {
            server.deactivate();
            server.reset();
        }
        self.overall_quality = Quality::default();
        self.overall_baseline = Stat::default();
        self.overall_previous = Stat::default();
        self.stat_timer = None;
        self.supervision_timer = None;
    }

    /// Forgets every server.
    pub fn clear_servers(&mut self) {
        for server in &mut self.servers {
            server.deactivate();
        }
        self.servers.clear();
        self.supervision_timer = None;
    }
}
