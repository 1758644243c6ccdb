//! Link selection engine for redundant report delivery.
//!
//! The selector ranks every known collector server by `priority + quality`,
//! keeps at most [`MAX_ACTIVE_LINKS`] transports alive, and fans each report
//! out across one or two ready links depending on the aggregate delivery
//! quality:
//! - Healthy aggregate (Good or better): a single link carries the report
//! - Degraded aggregate: the report is duplicated on the two best links

use serde::{Deserialize, Serialize};

pub mod classifier;
pub mod selector;

/// Hard ceiling on concurrently live transports per selector.
pub const MAX_ACTIVE_LINKS: usize = 2;

/// Delivery quality grade of a server or of the aggregate scope.
///
/// Lower ordinal is better. Comparison goes through [`Quality::is_at_least`]
/// rather than `Ord` so that "better" always reads the same way at call sites.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[default]
    Excellent = 0,
    Good = 1,
    Fair = 2,
    Poor = 3,
    Bad = 4,
}

impl Quality {
    pub const BEST: Quality = Quality::Excellent;
    pub const WORST: Quality = Quality::Bad;

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Contribution of this grade to a server's rank. Better grades score higher.
    pub fn score(self) -> u8 {
        Self::WORST.ordinal() - self.ordinal()
    }

    /// True when `self` is as good as `other` or better.
    pub fn is_at_least(self, other: Quality) -> bool {
        self.ordinal() <= other.ordinal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Excellent => "excellent",
            Quality::Good => "good",
            Quality::Fair => "fair",
            Quality::Poor => "poor",
            Quality::Bad => "bad",
        }
    }
}

/// Caller-supplied importance of a collector server. Higher is better.
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Fallback = 0,
    Normal = 1,
    Preferred = 2,
    Primary = 3,
}

impl Priority {
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Maps a raw ordinal onto a priority, saturating at [`Priority::Primary`].
    pub fn from_ordinal(ordinal: u8) -> Self {
        match ordinal {
            0 => Priority::Fallback,
            1 => Priority::Normal,
            2 => Priority::Preferred,
            _ => Priority::Primary,
        }
    }
}

/// Selection rank of a server. Larger ranks are selected first.
pub fn rank(priority: Priority, quality: Quality) -> u8 {
    priority.ordinal() + quality.score()
}

/// Category of a report, used to bucket delivery counters.
///
/// `All` is the "all types" bucket; every send and receive is counted there
/// in addition to its own type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportType {
    All = 0,
    Counter = 1,
    Event = 2,
    Log = 3,
}

impl ReportType {
    pub const COUNT: usize = 4;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportType::All => "all",
            ReportType::Counter => "counter",
            ReportType::Event => "event",
            ReportType::Log => "log",
        }
    }
}

/// Cumulative delivery counters for one report type within one scope.
///
/// `total_*` count physical transmissions and acknowledgements; `valid_*`
/// count distinct correlation keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub total_sent: u64,
    pub total_received: u64,
    pub valid_sent: u64,
    pub valid_received: u64,
}

impl Stat {
    /// Counter growth between `earlier` and `self`.
    pub fn delta_since(&self, earlier: &Stat) -> Stat {
        Stat {
            total_sent: self.total_sent.saturating_sub(earlier.total_sent),
            total_received: self.total_received.saturating_sub(earlier.total_received),
            valid_sent: self.valid_sent.saturating_sub(earlier.valid_sent),
            valid_received: self.valid_received.saturating_sub(earlier.valid_received),
        }
    }
}
