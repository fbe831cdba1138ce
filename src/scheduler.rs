//! Wall-clock aligned periodic probe scheduling.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Sleep until the next multiple of `frequency` since the Unix epoch, so
/// every agent configured with the same frequency fires in phase.
pub async fn align_to_boundary(frequency: Duration) {
    let frequency = frequency.as_nanos().max(1);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let next = (now / frequency + 1) * frequency;
    tokio::time::sleep(Duration::from_nanos((next - now) as u64)).await;
}

/// Run `burst` immediately and then once per `frequency`. A burst that
/// outlives its period overlaps the next one rather than delaying it.
pub fn spawn_periodic<F>(frequency: Duration, mut burst: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(frequency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            burst();
        }
    })
}

/// Spawn one probe task per target, spacing starts by `frequency / N` so a
/// burst spreads evenly across its period.
pub async fn fan_out<S>(frequency: Duration, targets: Vec<String>, mut spawn_probe: S)
where
    S: FnMut(String),
{
    if targets.is_empty() {
        return;
    }
    // interval() panics on a zero period
    let spacing = (frequency / targets.len() as u32).max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(spacing);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    for target in targets {
        ticker.tick().await;
        spawn_probe(target);
    }
}
