//! Probe operations layered on the ICMP engine.
//!
//! [`ping`] measures latency to a single target; [`mtr`] walks the path
//! toward it, accumulating per-hop statistics. Both drive probes through
//! the [`Prober`] seam so tests can substitute a scripted engine.

pub mod mtr;
pub mod ping;

pub use mtr::{mtr, HopInfo, MtrHopStat, MtrStat};
pub use ping::{ping, PingStat, PingSummary};

use crate::icmp::{IcmpManager, ProbeResult};
use async_trait::async_trait;
use log::debug;
use std::net::IpAddr;
use std::time::Duration;

/// Issues one probe and resolves it to a result.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: IpAddr, ttl: u8, timeout: Duration) -> ProbeResult;
}

#[async_trait]
impl Prober for IcmpManager {
    async fn probe(&self, target: IpAddr, ttl: u8, timeout: Duration) -> ProbeResult {
        match self.issue(target, ttl, timeout) {
            Ok(delivery) => delivery.await.unwrap_or_else(|_| ProbeResult::timeout()),
            Err(err) => {
                debug!("probe to {target} failed at issue: {err}");
                ProbeResult::timeout()
            }
        }
    }
}

pub(crate) fn millis(latency: Duration) -> f64 {
    latency.as_secs_f64() * 1_000.0
}

/// Online accumulation of latency samples, in milliseconds.
#[derive(Debug)]
pub(crate) struct LatencyAccumulator {
    pub sum: f64,
    pub sum_squares: f64,
    pub min: f64,
    pub max: f64,
    pub drop: u32,
    pub total: u32,
}

impl LatencyAccumulator {
    pub fn new() -> Self {
        LatencyAccumulator {
            sum: 0.0,
            sum_squares: 0.0,
            min: f64::MAX,
            max: 0.0,
            drop: 0,
            total: 0,
        }
    }

    pub fn record(&mut self, sample: f64) {
        self.sum += sample;
        self.sum_squares += sample * sample;
        self.min = self.min.min(sample);
        self.max = self.max.max(sample);
    }

    pub fn succeeded(&self) -> u32 {
        self.total - self.drop
    }

    pub fn avg(&self) -> f64 {
        self.sum / f64::from(self.succeeded())
    }

    /// Variance via E(X²) − E(X)², scaled by m(n−1)/n/(m−1) with n = total
    /// and m = succeeded to estimate the spread over all n probes rather
    /// than the m observed ones. NaN and ∞ collapse to 0.
    pub fn std_dev(&self) -> f64 {
        let succeed = f64::from(self.succeeded());
        let total = f64::from(self.total);
        let avg = self.avg();
        let dev = ((self.sum_squares / succeed - avg * avg) * succeed * (total - 1.0)
            / total
            / (succeed - 1.0))
            .sqrt();
        if dev.is_nan() || dev.is_infinite() {
            0.0
        } else {
            dev
        }
    }
}
