//! Tiered retry delivery with flip-flop backpressure queues.
//!
//! Fresh reports get one immediate send attempt; transient failures enter a
//! cascade of retry stages. Each stage owns two equal-capacity queues, `proc`
//! and `wait`. Reports normally land in `proc` and are retried when the
//! stage timer fires. When `proc` is full the report goes to `wait` instead,
//! and that very write is the overload signal: the stage drains `proc` at
//! once, then both sides swap the queues' roles so pushes land in the newly
//! empty one. A report failing at the last stage is trashed.

use super::sender::{ReportSink, SendOutcome};
use super::ReportContainer;
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// How long the congestion advisory stays silent after firing.
const CONGESTION_REARM: Duration = Duration::from_secs(120);

/// One retry stage: how long reports rest before a retry, and how many fit
/// in each of its two queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageConfig {
    pub interval: Duration,
    pub capacity: usize,
}

/// Parse a retry spec such as `"60,64;3600,64"` (seconds, slots per stage).
/// The special value `"0"` disables retries entirely.
pub fn parse_retry_spec(spec: &str) -> Result<Vec<StageConfig>> {
    let spec = spec.trim();
    if spec == "0" {
        return Ok(Vec::new());
    }
    spec.split(';')
        .map(|stage| {
            let (wait, capacity) = stage
                .split_once(',')
                .with_context(|| format!("bad retry stage '{stage}': expected 'seconds,capacity'"))?;
            let wait: u64 = wait
                .trim()
                .parse()
                .with_context(|| format!("bad retry interval in '{stage}'"))?;
            let capacity: usize = capacity
                .trim()
                .parse()
                .with_context(|| format!("bad retry capacity in '{stage}'"))?;
            if capacity == 0 {
                bail!("retry stage capacity must be positive in '{stage}'");
            }
            Ok(StageConfig {
                interval: Duration::from_secs(wait),
                capacity,
            })
        })
        .collect()
}

/// One-shot congestion advisory, re-armed on a timer.
struct CongestionGate {
    warned: AtomicBool,
}

impl CongestionGate {
    fn new() -> Self {
        CongestionGate {
            warned: AtomicBool::new(false),
        }
    }

    /// Returns whether this trip fired the advisory.
    fn trip(&self) -> bool {
        if self.warned.swap(true, Ordering::Relaxed) {
            return false;
        }
        warn!(
            "a retry stage is congested and reports are being discarded; the coordinator \
             or the network may be down. Consider a larger retry buffer or a shorter \
             send timeout"
        );
        true
    }

    fn rearm(&self) {
        self.warned.store(false, Ordering::Relaxed);
    }
}

/// Sender half of a stage's queue pair, held by whoever feeds that stage.
struct StagePush {
    proc: mpsc::Sender<ReportContainer>,
    wait: mpsc::Sender<ReportContainer>,
    congestion: Arc<CongestionGate>,
}

impl StagePush {
    /// Push-or-swap: `proc` first; on overflow the queues swap roles and the
    /// report lands in the other queue, signalling the stage to drain. Both
    /// full means the stage is congested and the report is dropped.
    fn push(&mut self, report: ReportContainer) {
        match self.proc.try_send(report) {
            Ok(()) => {}
            Err(TrySendError::Full(report)) => {
                mem::swap(&mut self.proc, &mut self.wait);
                match self.proc.try_send(report) {
                    Ok(()) => {}
                    Err(TrySendError::Full(report)) | Err(TrySendError::Closed(report)) => {
                        warn!(
                            "failed to queue {} report of {} for retry, congested; discarding",
                            report.kind(),
                            report.target()
                        );
                        self.congestion.trip();
                    }
                }
            }
            // receiver gone: shutting down
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// A retry stage task: drains `proc` when its timer fires or when a report
/// lands in `wait`.
struct Stage {
    interval: Duration,
    proc: mpsc::Receiver<ReportContainer>,
    wait: mpsc::Receiver<ReportContainer>,
    sink: Arc<dyn ReportSink>,
    downstream: StagePush,
}

impl Stage {
    async fn run(mut self) {
        loop {
            let deadline = tokio::time::Instant::now() + self.interval;
            tokio::select! {
                semaphore = self.wait.recv() => {
                    let Some(semaphore) = semaphore else { return };
                    info!(
                        "retry stage with interval {:?} draining: queue full",
                        self.interval
                    );
                    self.drain().await;
                    self.retry(semaphore).await;
                    // the push side already swapped; follow it
                    mem::swap(&mut self.proc, &mut self.wait);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if let Ok(report) = self.proc.try_recv() {
                        info!(
                            "retry stage with interval {:?} draining: timer fired",
                            self.interval
                        );
                        self.retry(report).await;
                        self.drain().await;
                    }
                }
            }
        }
    }

    async fn drain(&mut self) {
        while let Ok(report) = self.proc.try_recv() {
            self.retry(report).await;
        }
    }

    async fn retry(&mut self, report: ReportContainer) {
        debug!("retrying {} report of {}", report.kind(), report.target());
        match self.sink.deliver(&report).await {
            SendOutcome::Delivered => {}
            SendOutcome::Transient => self.downstream.push(report),
            // the sink already logged the reason
            SendOutcome::Fatal => {}
        }
    }
}

/// Handle for submitting fresh reports to the delivery pipeline.
#[derive(Clone)]
pub struct Pipeline {
    reports: mpsc::UnboundedSender<ReportContainer>,
}

impl Pipeline {
    /// Wire up the sender, the retry cascade described by `stages` (empty
    /// means no retries) and the terminal trash drain, and return the
    /// submission handle.
    pub fn spawn(sink: Arc<dyn ReportSink>, stages: &[StageConfig]) -> Pipeline {
        let congestion = Arc::new(CongestionGate::new());
        let rearm = Arc::clone(&congestion);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CONGESTION_REARM).await;
                rearm.rearm();
            }
        });

        let first = build_stages(Arc::clone(&sink), stages, congestion);
        let (failed_tx, failed_rx) = mpsc::channel(1);
        tokio::spawn(feed_first_stage(failed_rx, first));

        let (report_tx, report_rx) = mpsc::unbounded_channel();
        tokio::spawn(intake(report_rx, sink, failed_tx));
        Pipeline { reports: report_tx }
    }

    /// Queue a report for delivery. Infallible from the caller's view; a
    /// torn-down pipeline silently drops.
    pub fn submit(&self, report: ReportContainer) {
        let _ = self.reports.send(report);
    }
}

/// Build the cascade back to front and return the push half of the first
/// stage, or of the trash when no stages are configured.
fn build_stages(
    sink: Arc<dyn ReportSink>,
    stages: &[StageConfig],
    congestion: Arc<CongestionGate>,
) -> StagePush {
    let (trash_proc_tx, trash_proc_rx) = mpsc::channel(1);
    let (trash_wait_tx, trash_wait_rx) = mpsc::channel(1);
    // one independent drain per terminal queue
    spawn_trash(trash_proc_rx);
    spawn_trash(trash_wait_rx);

    let mut downstream = StagePush {
        proc: trash_proc_tx,
        wait: trash_wait_tx,
        congestion: Arc::clone(&congestion),
    };
    for config in stages.iter().rev() {
        let (proc_tx, proc_rx) = mpsc::channel(config.capacity);
        let (wait_tx, wait_rx) = mpsc::channel(config.capacity);
        let stage = Stage {
            interval: config.interval,
            proc: proc_rx,
            wait: wait_rx,
            sink: Arc::clone(&sink),
            downstream,
        };
        tokio::spawn(stage.run());
        downstream = StagePush {
            proc: proc_tx,
            wait: wait_tx,
            congestion: Arc::clone(&congestion),
        };
    }
    downstream
}

fn spawn_trash(mut queue: mpsc::Receiver<ReportContainer>) {
    tokio::spawn(async move {
        while let Some(report) = queue.recv().await {
            warn!(
                "discarding {} report of {}: retries exhausted",
                report.kind(),
                report.target()
            );
        }
    });
}

/// One send task per fresh report; transient failures go to the retry flow.
async fn intake(
    mut reports: mpsc::UnboundedReceiver<ReportContainer>,
    sink: Arc<dyn ReportSink>,
    failed: mpsc::Sender<ReportContainer>,
) {
    while let Some(report) = reports.recv().await {
        let sink = Arc::clone(&sink);
        let failed = failed.clone();
        tokio::spawn(async move {
            if sink.deliver(&report).await == SendOutcome::Transient {
                let _ = failed.send(report).await;
            }
        });
    }
}

async fn feed_first_stage(mut failed: mpsc::Receiver<ReportContainer>, mut first: StagePush) {
    while let Some(report) = failed.recv().await {
        first.push(report);
    }
}
