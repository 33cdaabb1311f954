//! Collection window. A cancellable timed wait while flow records accumulate,
//! with progress emitted at a fixed cadence.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::ScanError;
use crate::orchestrator::{ScanEvent, ScanPhase};
use crate::stop::StopSignal;

pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(15);

/// Wait out the collection window. A stop mid-window returns `Cancelled`,
/// which the orchestrator routes straight into cleanup.
pub async fn collect_window(
    duration: Duration,
    stop: &StopSignal,
    events: &mpsc::Sender<ScanEvent>,
) -> Result<(), ScanError> {
    let started = tokio::time::Instant::now();
    let deadline = started + duration;
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Ok(());
        }
        let remaining = deadline - now;
        let _ = events
            .send(ScanEvent::Progress {
                phase: ScanPhase::Collect,
                elapsed: now - started,
                remaining,
            })
            .await;
        let step = remaining.min(PROGRESS_INTERVAL);
        if !stop.sleep(step).await {
            return Err(ScanError::Cancelled);
        }
    }
}
