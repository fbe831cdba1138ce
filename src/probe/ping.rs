//! Single-target latency measurement.

use super::{millis, LatencyAccumulator, Prober};
use crate::config::PingConfig;
use crate::dns::resolve_target;
use crate::icmp::{CODE_ECHO_REPLY, DIRECT_TTL};
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Latency statistics for one target, as reported to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingStat {
    pub ip: String,
    pub stat: PingSummary,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingSummary {
    pub timeout: bool,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
    pub drop: u32,
    pub total: u32,
}

/// Probe `target` `count` times and aggregate the replies. Only Echo
/// Replies count as success; every other outcome is a drop. When nothing
/// came back the stat is marked `timeout` and carries no latencies.
pub async fn ping(prober: &dyn Prober, target: &str, config: &PingConfig) -> Result<PingStat> {
    let addr = resolve_target(target).await?;
    let mut acc = LatencyAccumulator::new();
    acc.total = config.count;
    for _ in 0..config.count {
        let result = prober.probe(addr, DIRECT_TTL, config.timeout).await;
        if result.code == CODE_ECHO_REPLY {
            acc.record(millis(result.latency));
        } else {
            acc.drop += 1;
        }
        tokio::time::sleep(config.interval).await;
    }

    let mut stat = PingStat {
        ip: addr.to_string(),
        stat: PingSummary {
            drop: acc.drop,
            total: acc.total,
            max: acc.max,
            ..PingSummary::default()
        },
    };
    if acc.drop == acc.total {
        stat.stat.timeout = true;
        return Ok(stat);
    }
    stat.stat.min = acc.min;
    stat.stat.avg = acc.avg();
    stat.stat.std_dev = acc.std_dev();
    Ok(stat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::icmp::ProbeResult;
    use crate::Prober;
    use async_trait::async_trait;
    use std::net::IpAddr;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays a scripted sequence of results, then times out forever.
    struct ScriptedProber {
        script: Mutex<Vec<ProbeResult>>,
    }

    impl ScriptedProber {
        fn new(results: Vec<ProbeResult>) -> Self {
            let mut script = results;
            script.reverse();
            ScriptedProber {
                script: Mutex::new(script),
            }
        }

        fn reply(millis: u64) -> ProbeResult {
            ProbeResult {
                source: Some("127.0.0.1".parse().unwrap()),
                latency: Duration::from_millis(millis),
                code: CODE_ECHO_REPLY,
            }
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, _target: IpAddr, _ttl: u8, _timeout: Duration) -> ProbeResult {
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(ProbeResult::timeout)
        }
    }

    fn config(count: u32) -> PingConfig {
        PingConfig {
            frequency: Duration::from_secs(60),
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(100),
            count,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn all_replies_yield_full_statistics() {
        let prober = ScriptedProber::new(vec![
            ScriptedProber::reply(4),
            ScriptedProber::reply(8),
            ScriptedProber::reply(6),
        ]);
        let stat = ping(&prober, "127.0.0.1", &config(3)).await.unwrap();
        assert_eq!(stat.ip, "127.0.0.1");
        assert!(!stat.stat.timeout);
        assert_eq!(stat.stat.total, 3);
        assert_eq!(stat.stat.drop, 0);
        assert!((stat.stat.avg - 6.0).abs() < 1e-9);
        assert_eq!(stat.stat.min, 4.0);
        assert_eq!(stat.stat.max, 8.0);
        // (116/3 − 36) · 3 · 2 / 3 / 2, the n = m case of the estimator
        let expected = (116.0 / 3.0 - 36.0_f64).sqrt();
        assert!((stat.stat.std_dev - expected).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_drops_count_against_total() {
        let prober = ScriptedProber::new(vec![
            ScriptedProber::reply(10),
            ProbeResult::timeout(),
            ScriptedProber::reply(20),
            ProbeResult {
                source: Some("192.0.2.9".parse().unwrap()),
                latency: Duration::from_millis(3),
                code: 3, // port unreachable is a drop, not a sample
            },
        ]);
        let stat = ping(&prober, "127.0.0.1", &config(4)).await.unwrap();
        assert_eq!(stat.stat.total, 4);
        assert_eq!(stat.stat.drop, 2);
        assert!((stat.stat.avg - 15.0).abs() < 1e-9);
        assert_eq!(stat.stat.min, 10.0);
        assert_eq!(stat.stat.max, 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn all_drops_mark_timeout_with_zeroed_extremes() {
        let prober = ScriptedProber::new(vec![]);
        let stat = ping(&prober, "192.0.2.1", &config(2)).await.unwrap();
        assert!(stat.stat.timeout);
        assert_eq!(stat.stat.drop, 2);
        assert_eq!(stat.stat.total, 2);
        assert_eq!(stat.stat.min, 0.0);
        assert_eq!(stat.stat.avg, 0.0);
        assert_eq!(stat.stat.std_dev, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn literal_target_passes_through_unresolved() {
        let prober = ScriptedProber::new(vec![ScriptedProber::reply(1)]);
        let stat = ping(&prober, "2001:db8::1", &config(1)).await.unwrap();
        assert_eq!(stat.ip, "2001:db8::1");
    }
}
