//! End-to-end runtime tests over loopback sockets.
//!
//! A plain `UdpSocket` / `TcpListener` stands in for the collector and echoes
//! an acknowledgement frame carrying the report's message id.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use report_link::config::ServerConfig;
use report_link::protocol::header::ReportFrameHeader;
use report_link::{OutgoingReport, Priority, ReportLinkConfig, ReportRuntime, ReportType};

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn heartbeat(seq: u16) -> OutgoingReport {
    let payload = b"heartbeat";
    OutgoingReport {
        data: ReportFrameHeader::new(1, seq, payload.len())
            .unwrap()
            .wrap(payload),
        report_type: ReportType::Event,
        key: u64::from(seq),
        seq: u32::from(seq),
    }
}

fn config_for(address: SocketAddr) -> ReportLinkConfig {
    ReportLinkConfig {
        servers: vec![ServerConfig {
            address,
            priority: Priority::Primary,
        }],
        ..ReportLinkConfig::default()
    }
}

// ────────────────────────────────────────────────────────────────
// 1. UDP: send, echo, acknowledge
// ────────────────────────────────────────────────────────────────

#[test]
fn udp_report_is_acknowledged() {
    let collector = UdpSocket::bind("127.0.0.1:0").unwrap();
    collector
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let address = collector.local_addr().unwrap();

    let rt = ReportRuntime::new(config_for(address)).unwrap();
    assert!(wait_for(|| rt.snapshot().ready_count() == 1));

    rt.try_send_report(heartbeat(7)).unwrap();

    let mut buf = [0u8; 256];
    let (n, from) = collector.recv_from(&mut buf).unwrap();
    let frame = ReportFrameHeader::decode(Bytes::copy_from_slice(&buf[..n])).unwrap();
    assert_eq!(frame.header.message_id, 7);
    assert_eq!(frame.payload, Bytes::from_static(b"heartbeat"));

    let ack = ReportFrameHeader::new(frame.header.server_type, 7, 0)
        .unwrap()
        .wrap(&[]);
    collector.send_to(&ack, from).unwrap();

    let (source, inbound) = rt.inbound().recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(source, address);
    rt.acknowledge(source, u32::from(inbound.header.message_id))
        .unwrap();

    let stat = rt
        .get_stat(ReportType::Event, Some(address))
        .unwrap()
        .unwrap();
    assert_eq!(stat.total_sent, 1);
    assert_eq!(stat.valid_received, 1);

    let snapshot = rt.snapshot();
    assert_eq!(snapshot.servers[0].address, address.to_string());
    assert!(snapshot.to_json().unwrap().contains("\"transport\":\"udp\""));
}

// ────────────────────────────────────────────────────────────────
// 2. TCP alternate transport
// ────────────────────────────────────────────────────────────────

#[test]
fn alternate_transport_reaches_tcp_collector() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();

    let rt = ReportRuntime::new(ReportLinkConfig::default()).unwrap();
    rt.set_use_alternate_transport_kind(true).unwrap();
    rt.update_servers(vec![address], Priority::Normal).unwrap();

    let (mut peer, _) = listener.accept().unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    assert!(wait_for(|| rt.snapshot().ready_count() == 1));

    rt.try_send_report(heartbeat(3)).unwrap();
    let mut buf = vec![0u8; ReportFrameHeader::SIZE + b"heartbeat".len()];
    peer.read_exact(&mut buf).unwrap();
    let frame = ReportFrameHeader::decode(Bytes::from(buf)).unwrap();
    assert_eq!(frame.header.message_id, 3);

    let ack = ReportFrameHeader::new(1, 3, 0).unwrap().wrap(&[]);
    peer.write_all(&ack).unwrap();
    let (_, inbound) = rt.inbound().recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(inbound.header.message_id, 3);
}

// ────────────────────────────────────────────────────────────────
// 3. Lifecycle
// ────────────────────────────────────────────────────────────────

#[test]
fn reset_forgets_counters_and_shutdown_is_clean() {
    let collector = UdpSocket::bind("127.0.0.1:0").unwrap();
    let address = collector.local_addr().unwrap();

    let mut rt = ReportRuntime::new(config_for(address)).unwrap();
    assert!(wait_for(|| rt.snapshot().ready_count() == 1));
    rt.try_send_report(heartbeat(1)).unwrap();
    assert!(wait_for(|| rt
        .get_stat(ReportType::All, None)
        .unwrap()
        .is_some_and(|s| s.total_sent == 1)));

    rt.reset_all().unwrap();
    assert_eq!(rt.get_stat(ReportType::All, None).unwrap(), None);
    assert!(wait_for(|| rt.snapshot().servers.iter().all(|s| !s.activated)));

    rt.shutdown();
    assert!(rt.try_send_report(heartbeat(2)).is_err());
}

#[test]
fn unreachable_collector_still_shuts_down() {
    let address: SocketAddr = "255.255.255.255:7000".parse().unwrap();
    let rt = ReportRuntime::new(config_for(address)).unwrap();
    thread::sleep(Duration::from_millis(300));
    assert_eq!(rt.snapshot().ready_count(), 0);

    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        drop(rt);
        let _ = done_tx.send(());
    });
    assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
}
