//! Pre-approval volume estimate. Reads the gateway's outbound byte metric for
//! the trailing hour so the approval prompt can show expected log volume.
//! Strictly best-effort: any failure degrades to a static default and never
//! blocks the scan.

use chrono::{Duration, Utc};

use crate::error::ScanError;

/// Default assumption when the metric is unavailable: 1 GB/hour.
pub const FALLBACK_HOURLY_BYTES: f64 = 1_073_741_824.0;

pub trait MetricsBackend {
    /// Sum of bytes the gateway sent to destinations between the two epoch
    /// timestamps.
    async fn nat_bytes_out(
        &self,
        gateway_id: &str,
        start_epoch: i64,
        end_epoch: i64,
    ) -> Result<f64, ScanError>;
}

#[derive(Debug, Clone, Copy)]
pub struct VolumeEstimate {
    pub hourly_bytes: f64,
    /// False when the static fallback was used.
    pub from_metrics: bool,
}

impl VolumeEstimate {
    pub fn sample_bytes(&self, minutes: u64) -> f64 {
        self.hourly_bytes * minutes as f64 / 60.0
    }
}

pub async fn estimate_hourly_bytes<B: MetricsBackend>(
    backend: &B,
    gateway_id: &str,
) -> VolumeEstimate {
    let end = Utc::now();
    let start = end - Duration::hours(1);
    match backend
        .nat_bytes_out(gateway_id, start.timestamp(), end.timestamp())
        .await
    {
        Ok(bytes) if bytes > 0.0 => VolumeEstimate {
            hourly_bytes: bytes,
            from_metrics: true,
        },
        _ => VolumeEstimate {
            hourly_bytes: FALLBACK_HOURLY_BYTES,
            from_metrics: false,
        },
    }
}
