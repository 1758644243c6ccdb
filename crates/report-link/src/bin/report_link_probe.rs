//! # Report link probe
//!
//! Drives a [`ReportRuntime`] against live collectors: sends a heartbeat
//! report every second, answers nothing itself, and logs the link snapshot
//! periodically so failover and duplication can be watched from the shell.
//!
//! ## Usage
//!
//! ```bash
//! # Two collectors, primary first
//! report-link-probe --server 10.0.0.1:7000 --priority 3 --server 10.0.0.2:7000
//!
//! # From a TOML file, over TCP
//! report-link-probe --config link.toml --alternate
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use report_link::protocol::header::ReportFrameHeader;
use report_link::{OutgoingReport, Priority, ReportLinkConfig, ReportRuntime, ReportType};

const HEARTBEAT_SERVER_TYPE: u16 = 1;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5);

struct ServerArg {
    addresses: Vec<SocketAddr>,
    priority: Priority,
}

struct Args {
    config: Option<String>,
    servers: Vec<ServerArg>,
    alternate: bool,
}

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Parse CLI ───────────────────────────────────────────────
    let args = parse_args()?;

    let config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("cannot read config '{}': {}", path, e))?;
            ReportLinkConfig::from_toml_str(&text)
                .map_err(|e| anyhow::anyhow!("invalid config '{}': {}", path, e))?
        }
        None => ReportLinkConfig::default(),
    };

    tracing::info!(
        config = ?args.config,
        configured = config.servers.len(),
        extra = args.servers.len(),
        alternate = args.alternate,
        "report-link-probe starting"
    );

    // ── Runtime ─────────────────────────────────────────────────
    let rt = ReportRuntime::new(config)?;
    if args.alternate {
        rt.set_use_alternate_transport_kind(true)?;
    }
    for server in args.servers {
        tracing::info!(addresses = ?server.addresses, priority = ?server.priority, "servers added");
        rt.update_servers(server.addresses, server.priority)?;
    }

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })?;
    }

    // ── Main loop ───────────────────────────────────────────────
    // Collectors echo the 16-bit message id, which doubles as the sequence.
    let mut seq: u16 = 0;
    let mut sent: u64 = 0;
    let mut last_heartbeat = Instant::now() - HEARTBEAT_INTERVAL;
    let mut last_snapshot = Instant::now();

    while running.load(Ordering::Relaxed) {
        if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
            seq = seq.wrapping_add(1);
            sent += 1;
            let payload = format!("heartbeat {}", seq);
            let frame = ReportFrameHeader::new(HEARTBEAT_SERVER_TYPE, seq, payload.len())
                .map(|header| header.wrap(payload.as_bytes()))
                .unwrap_or_else(|| Bytes::from(payload));
            let report = OutgoingReport {
                data: frame,
                report_type: ReportType::Event,
                key: sent,
                seq: u32::from(seq),
            };
            if let Err(e) = rt.try_send_report(report) {
                tracing::warn!(error = %e, seq, "heartbeat dropped");
            }
            last_heartbeat = Instant::now();
        }

        match rt.inbound().recv_timeout(Duration::from_millis(100)) {
            Ok((from, frame)) => {
                tracing::debug!(
                    %from,
                    message_id = frame.header.message_id,
                    len = frame.payload.len(),
                    "frame received"
                );
                rt.acknowledge(from, u32::from(frame.header.message_id))?;
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }

        if last_snapshot.elapsed() >= SNAPSHOT_INTERVAL {
            let snapshot = rt.snapshot();
            match snapshot.to_json() {
                Ok(json) => tracing::info!(
                    ready = snapshot.ready_count(),
                    quality = snapshot.aggregate_quality.as_str(),
                    "{}",
                    json
                ),
                Err(e) => tracing::warn!(error = %e, "snapshot serialization failed"),
            }
            last_snapshot = Instant::now();
        }
    }

    tracing::info!(sent, "report-link-probe stopped");
    Ok(())
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = None;
    let mut servers: Vec<ServerArg> = Vec::new();
    let mut alternate = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                config = Some(
                    args.get(i)
                        .ok_or_else(|| anyhow::anyhow!("--config requires a value"))?
                        .clone(),
                );
            }
            "--server" | "-s" => {
                i += 1;
                let val = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--server requires a value"))?;
                let mut addresses = Vec::new();
                for part in val.split(',') {
                    let addr: SocketAddr = part.trim().parse().map_err(|e| {
                        anyhow::anyhow!("invalid server address '{}': {}", part.trim(), e)
                    })?;
                    addresses.push(addr);
                }
                servers.push(ServerArg {
                    addresses,
                    priority: Priority::Normal,
                });
            }
            "--priority" | "-p" => {
                i += 1;
                let val = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--priority requires a value"))?;
                let level: u8 = val
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid priority '{}': {}", val, e))?;
                let last = servers
                    .last_mut()
                    .ok_or_else(|| anyhow::anyhow!("--priority must follow --server"))?;
                last.priority = Priority::from_ordinal(level);
            }
            "--alternate" | "-a" => alternate = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument '{}' (see --help)", other),
        }
        i += 1;
    }

    if config.is_none() && servers.is_empty() {
        anyhow::bail!("at least one --server or a --config is required");
    }

    Ok(Args {
        config,
        servers,
        alternate,
    })
}

fn print_help() {
    println!(
        "report-link-probe: send heartbeat reports over a redundant collector link

USAGE:
    report-link-probe [--config FILE] [--server ADDR[,ADDR...] [--priority 0-3]]... [--alternate]

OPTIONS:
    -c, --config FILE      TOML link configuration
    -s, --server ADDRS     Comma-separated collector addresses (repeatable)
    -p, --priority LEVEL   Priority for the preceding --server (0 fallback .. 3 primary)
    -a, --alternate        Use the alternate (TCP) transport kind
    -h, --help             Show this help"
    );
}
