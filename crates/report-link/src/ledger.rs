//! Per-destination delivery accounting.
//!
//! Every send and acknowledgement is written twice: once into the ledger of
//! the destination that carried it and once into the aggregate ledger that
//! stands for "any destination". The aggregate is never derived from the
//! per-destination ledgers.
//!
//! Correlation records map a logical report key to the physical sequence
//! numbers it was transmitted under. Records idle for longer than the record
//! TTL are swept by a timer that only runs while some ledger holds records.

use quanta::Instant;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::debug;

use crate::config::TimerConfig;
use crate::scheduler::{ReportType, Stat};
use crate::timer::{Scheduler, TimerHandle, TimerKind};

/// Logical identifier of one outgoing report.
pub type CorrelationKey = u64;
/// Per-transmission identifier echoed back in acknowledgements.
pub type SequenceNumber = u32;

#[derive(Debug, Clone)]
pub struct CorrelationRecord {
    pub report_type: ReportType,
    pub sequences: Vec<SequenceNumber>,
    pub last_send: Instant,
    pub acknowledged: bool,
}

impl CorrelationRecord {
    fn new(report_type: ReportType, now: Instant) -> Self {
        Self {
            report_type,
            sequences: Vec::new(),
            last_send: now,
            acknowledged: false,
        }
    }
}

fn bump(counters: &mut [Stat; ReportType::COUNT], ty: ReportType, apply: impl Fn(&mut Stat)) {
    apply(&mut counters[ty.index()]);
    if ty != ReportType::All {
        apply(&mut counters[ReportType::All.index()]);
    }
}

/// Accounting for one scope (a destination or the aggregate).
#[derive(Debug, Default)]
pub struct Ledger {
    records: HashMap<CorrelationKey, CorrelationRecord>,
    by_sequence: HashMap<SequenceNumber, CorrelationKey>,
    counters: [Stat; ReportType::COUNT],
}

impl Ledger {
    pub fn is_active(&self) -> bool {
        !self.records.is_empty()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn record(&self, key: CorrelationKey) -> Option<&CorrelationRecord> {
        self.records.get(&key)
    }

    pub fn resolve(&self, seq: SequenceNumber) -> Option<CorrelationKey> {
        self.by_sequence.get(&seq).copied()
    }

    pub fn stat(&self, ty: ReportType) -> Stat {
        self.counters[ty.index()]
    }

    fn record_send(
        &mut self,
        ty: ReportType,
        key: CorrelationKey,
        seq: SequenceNumber,
        now: Instant,
    ) {
        // A wrapped sequence number may still point at an older key.
        if let Some(previous) = self.by_sequence.insert(seq, key) {
            if previous != key {
                if let Some(old) = self.records.get_mut(&previous) {
                    old.sequences.retain(|s| *s != seq);
                }
            }
        }

        let record = match self.records.entry(key) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                bump(&mut self.counters, ty, |s| s.valid_sent += 1);
                e.insert(CorrelationRecord::new(ty, now))
            }
        };
        if !record.sequences.contains(&seq) {
            record.sequences.push(seq);
        }
        record.last_send = now;

        bump(&mut self.counters, ty, |s| s.total_sent += 1);
    }

    fn record_receive(&mut self, seq: SequenceNumber) -> bool {
        let Some(key) = self.by_sequence.get(&seq) else {
            return false;
        };
        let Some(record) = self.records.get_mut(key) else {
            return false;
        };
        let ty = record.report_type;
        let first = !record.acknowledged;
        record.acknowledged = true;

        bump(&mut self.counters, ty, |s| s.total_received += 1);
        if first {
            bump(&mut self.counters, ty, |s| s.valid_received += 1);
        }
        true
    }

    fn sweep(&mut self, now: Instant, ttl: impl Fn(ReportType) -> Duration) -> usize {
        let expired: Vec<CorrelationKey> = self
            .records
            .iter()
            .filter(|(_, r)| now.saturating_duration_since(r.last_send) > ttl(r.report_type))
            .map(|(k, _)| *k)
            .collect();

        for key in &expired {
            if let Some(record) = self.records.remove(key) {
                for seq in record.sequences {
                    if self.by_sequence.get(&seq) == Some(key) {
                        self.by_sequence.remove(&seq);
                    }
                }
            }
        }
        expired.len()
    }
}

/// All ledgers plus the self-arming sweep timer.
pub struct DeliveryLedger {
    destinations: HashMap<SocketAddr, Ledger>,
    aggregate: Ledger,
    aggregate_tracked: bool,
    record_ttl: Duration,
    sweep_interval: Duration,
    sweep_timer: Option<TimerHandle>,
}

impl DeliveryLedger {
    pub fn new(timers: &TimerConfig) -> Self {
        Self {
            destinations: HashMap::new(),
            aggregate: Ledger::default(),
            aggregate_tracked: false,
            record_ttl: timers.record_ttl,
            sweep_interval: timers.sweep_interval,
            sweep_timer: None,
        }
    }

    /// Time-to-live of an idle correlation record of type `ty`.
    pub fn ttl(&self, _ty: ReportType) -> Duration {
        self.record_ttl
    }

    pub fn on_send(
        &mut self,
        scheduler: &mut dyn Scheduler,
        address: SocketAddr,
        ty: ReportType,
        key: CorrelationKey,
        seq: SequenceNumber,
        now: Instant,
    ) {
        self.destinations
            .entry(address)
            .or_default()
            .record_send(ty, key, seq, now);
        self.aggregate.record_send(ty, key, seq, now);
        self.aggregate_tracked = true;
        self.arm_sweep(scheduler);
    }

    /// Returns whether the sequence number resolved in the destination ledger.
    pub fn on_receive(
        &mut self,
        scheduler: &mut dyn Scheduler,
        address: SocketAddr,
        seq: SequenceNumber,
    ) -> bool {
        let resolved = self
            .destinations
            .get_mut(&address)
            .is_some_and(|l| l.record_receive(seq));
        self.aggregate.record_receive(seq);
        self.arm_sweep(scheduler);
        resolved
    }

    /// Cumulative counters for `ty` in the given scope, or `None` if the
    /// scope has never been tracked.
    pub fn get_stat(&self, ty: ReportType, address: Option<SocketAddr>) -> Option<Stat> {
        match address {
            Some(addr) => self.destinations.get(&addr).map(|l| l.stat(ty)),
            None if self.aggregate_tracked => Some(self.aggregate.stat(ty)),
            None => None,
        }
    }

    pub fn destination(&self, address: SocketAddr) -> Option<&Ledger> {
        self.destinations.get(&address)
    }

    pub fn aggregate(&self) -> &Ledger {
        &self.aggregate
    }

    pub fn is_active(&self) -> bool {
        self.aggregate.is_active() || self.destinations.values().any(Ledger::is_active)
    }

    pub fn is_sweep_armed(&self) -> bool {
        self.sweep_timer.is_some()
    }

    /// Evicts idle records from every ledger. Cancels the sweep timer once
    /// nothing is left to sweep. Returns the number of evicted records.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let ttl = self.record_ttl;
        let mut evicted = 0;
        for ledger in self.destinations.values_mut() {
            evicted += ledger.sweep(now, |_| ttl);
        }
        evicted += self.aggregate.sweep(now, |_| ttl);

        if !self.is_active() && self.sweep_timer.take().is_some() {
            debug!("all ledgers idle, sweep timer stopped");
        }
        evicted
    }

    pub fn clear(&mut self) {
        self.destinations.clear();
        self.aggregate = Ledger::default();
        self.aggregate_tracked = false;
        self.sweep_timer = None;
    }

    fn arm_sweep(&mut self, scheduler: &mut dyn Scheduler) {
        if self.sweep_timer.is_none() && self.is_active() {
            self.sweep_timer = Some(scheduler.schedule(TimerKind::Sweep, self.sweep_interval));
        }
    }
}
