//! # report-link
//!
//! Redundant, quality-aware link layer for delivering telemetry reports to a
//! set of collector servers.
//!
//! - [`scheduler::selector`] ranks candidate servers and keeps at most two of
//!   them connected, duplicating reports when the aggregate grade degrades.
//! - [`ledger`] correlates sends with acknowledgements and keeps the
//!   counters the grading is derived from.
//! - [`link::ReportLink`] is the single-threaded facade over both;
//!   [`runtime::ReportRuntime`] runs it on a worker thread.

pub mod config;
pub mod ledger;
pub mod link;
pub mod net;
pub mod protocol;
pub mod runtime;
pub mod scheduler;
pub mod stats;
pub mod timer;

pub use config::ReportLinkConfig;
pub use link::ReportLink;
pub use runtime::{CommandError, OutgoingReport, ReportRuntime};
pub use scheduler::{Priority, Quality, ReportType, Stat};
