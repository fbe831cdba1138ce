//! End-to-end probes over loopback.
//!
//! These exercise the real ICMP engine and need raw-socket permission
//! (root or CAP_NET_RAW); without it the test prints a notice and passes.
//!
//! All scenarios share one test function: the engine is process-global and
//! its background tasks live on the runtime that first touched it.

use planet::config::{MtrConfig, PingConfig};
use planet::dns::RdnsService;
use planet::{mtr, ping, IcmpManager};
use std::time::Duration;

fn have_raw_socket_permission() -> bool {
    socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::RAW,
        Some(socket2::Protocol::ICMPV4),
    )
    .is_ok()
}

#[tokio::test]
async fn end_to_end_probes_over_loopback() {
    if !have_raw_socket_permission() {
        eprintln!("skipping: raw sockets unavailable (need root or CAP_NET_RAW)");
        return;
    }
    let manager = IcmpManager::global();

    // loopback ping: three probes, all answered within single-digit millis
    let config = PingConfig {
        frequency: Duration::from_secs(60),
        interval: Duration::from_millis(10),
        timeout: Duration::from_secs(1),
        count: 3,
    };
    let stat = ping(manager, "127.0.0.1", &config).await.unwrap();
    assert_eq!(stat.ip, "127.0.0.1");
    assert_eq!(stat.stat.total, 3);
    assert_eq!(stat.stat.drop, 0, "loopback probes must not drop");
    assert!(!stat.stat.timeout);
    assert!(
        stat.stat.avg >= 0.0 && stat.stat.avg < 5.0,
        "loopback latency out of range: {} ms",
        stat.stat.avg
    );
    assert!(stat.stat.min <= stat.stat.avg && stat.stat.avg <= stat.stat.max);
    assert!(stat.stat.std_dev >= 0.0);

    // unroutable ping: TEST-NET-1 never answers
    let config = PingConfig {
        frequency: Duration::from_secs(60),
        interval: Duration::from_millis(10),
        timeout: Duration::from_millis(100),
        count: 2,
    };
    let stat = ping(manager, "192.0.2.1", &config).await.unwrap();
    assert_eq!(stat.stat.total, 2);
    assert_eq!(stat.stat.drop, 2);
    assert!(stat.stat.timeout);
    assert_eq!(stat.stat.min, 0.0);

    // MTR to loopback: the path is one hop ending in an Echo Reply
    let rdns = RdnsService::with_capacity(16);
    rdns.prime("127.0.0.1", "localhost");
    let config = MtrConfig {
        frequency: Duration::from_secs(60),
        timeout: Duration::from_secs(1),
        interval: Duration::from_millis(10),
        max_ttl: 30,
        count: 2,
    };
    let stat = mtr(manager, &rdns, "127.0.0.1", &config).await.unwrap();
    assert_eq!(stat.hop_count, 1);
    assert_eq!(stat.stat.len(), 1);
    let hop = &stat.stat[0];
    assert_eq!(hop.index, 1);
    assert!(!hop.timeout);
    assert_eq!(hop.addr.len(), 1);
    assert_eq!(hop.addr[0].ip, "127.0.0.1");
    assert_eq!(hop.addr[0].code, planet::CODE_ECHO_REPLY);
    assert_eq!(hop.addr[0].rdns, "localhost");
}
