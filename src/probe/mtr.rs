//! Multi-hop path statistics (MTR).
//!
//! Each round walks TTL 1..max_ttl until a terminal reply (Echo Reply or
//! Destination Unreachable) ends the round. Hops past the real path end
//! keep answering with the terminal responder's address; the tail trim
//! removes those repeats before the stat is built.

use super::{millis, LatencyAccumulator, Prober};
use crate::config::MtrConfig;
use crate::dns::{resolve_target, RdnsService};
use crate::icmp::{CODE_TIMEOUT, CODE_TIME_EXCEEDED};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

/// One responder seen at a hop. Identity is (ip, code); the reverse-DNS
/// name is cosmetic and filled in only when the stat is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopInfo {
    pub ip: String,
    pub rdns: String,
    pub code: u16,
}

impl PartialEq for HopInfo {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.code == other.code
    }
}

impl Eq for HopInfo {}

impl Hash for HopInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.code.hash(state);
    }
}

/// Statistics for one retained hop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MtrHopStat {
    pub index: u32,
    pub timeout: bool,
    pub addr: Vec<HopInfo>,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
    pub drop: u32,
    pub total: u32,
}

/// Path statistics for one target, as reported to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MtrStat {
    pub ip: String,
    pub hop_count: u32,
    pub stat: Vec<MtrHopStat>,
}

struct HopAccumulator {
    addrs: HashSet<HopInfo>,
    stats: LatencyAccumulator,
}

impl HopAccumulator {
    fn new() -> Self {
        HopAccumulator {
            addrs: HashSet::new(),
            stats: LatencyAccumulator::new(),
        }
    }
}

/// Walk the path toward `target` `count` times and aggregate per-hop
/// statistics, trimming the repeated tail past the real path end.
pub async fn mtr(
    prober: &dyn Prober,
    rdns: &RdnsService,
    target: &str,
    config: &MtrConfig,
) -> Result<MtrStat> {
    let addr = resolve_target(target).await?;
    let max_ttl = usize::from(config.max_ttl);
    let mut hops: Vec<HopAccumulator> = (0..max_ttl).map(|_| HopAccumulator::new()).collect();
    // zero-based: hop index i probes with TTL i+1
    let mut min_hop = max_ttl;
    let mut max_hop = 0usize;

    for _round in 0..config.count {
        for hop in 0..max_ttl {
            hops[hop].stats.total += 1;
            let result = prober.probe(addr, (hop + 1) as u8, config.timeout).await;
            tokio::time::sleep(config.interval).await;
            if result.code == CODE_TIMEOUT {
                hops[hop].stats.drop += 1;
                continue;
            }
            let source = result.source.map(|ip| ip.to_string()).unwrap_or_default();
            hops[hop].addrs.insert(HopInfo {
                ip: source,
                rdns: String::new(),
                code: result.code,
            });
            hops[hop].stats.record(millis(result.latency));
            if result.code != CODE_TIME_EXCEEDED {
                // terminal reply: hops beyond this answer nothing new
                min_hop = min_hop.min(hop);
                max_hop = max_hop.max(hop + 1);
                break;
            }
        }
    }

    // Trim the tail: a hop whose responders equal the previous hop's is the
    // terminal responder answering past the path end; a hop that never
    // answered is walked through without moving the boundary.
    let mut hop = max_hop.saturating_sub(1);
    while hop > min_hop {
        if hops[hop].stats.drop == hops[hop].stats.total {
            hop -= 1;
            continue;
        }
        if hops[hop].addrs == hops[hop - 1].addrs {
            max_hop = hop;
            hop -= 1;
        } else {
            break;
        }
    }

    let mut stat: Vec<MtrHopStat> = Vec::new();
    for (index, hop) in hops.iter().take(max_hop).enumerate() {
        if hop.stats.total == 0 {
            break;
        }
        let mut entry = MtrHopStat {
            index: (index + 1) as u32,
            timeout: false,
            addr: Vec::new(),
            avg: 0.0,
            min: 0.0,
            max: hop.stats.max,
            std_dev: 0.0,
            drop: hop.stats.drop,
            total: hop.stats.total,
        };
        if hop.stats.drop == hop.stats.total {
            entry.timeout = true;
            stat.push(entry);
            continue;
        }
        for info in &hop.addrs {
            entry.addr.push(HopInfo {
                ip: info.ip.clone(),
                rdns: rdns.lookup(&info.ip).await,
                code: info.code,
            });
        }
        entry.min = hop.stats.min;
        entry.avg = hop.stats.avg();
        entry.std_dev = hop.stats.std_dev();
        stat.push(entry);
    }

    Ok(MtrStat {
        ip: target.to_string(),
        hop_count: stat.len() as u32,
        stat,
    })
}
