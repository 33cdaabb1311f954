//! Final result object. Immutable and serializable; rendering it is the
//! binary's job, never the engines'.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::analysis::TrafficStatistics;
use crate::cost::CostEstimate;
use crate::remediation::EndpointAnalysis;

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub run_id: String,
    pub region: String,
    pub gateway_id: String,
    pub vpc_id: String,
    pub window_minutes: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub statistics: TrafficStatistics,
    pub estimate: CostEstimate,
    pub endpoint_analysis: EndpointAnalysis,
    /// The delivery destination, when it was kept for inspection.
    pub log_group: Option<String>,
    pub log_group_kept: bool,
    /// Anything the cleanup pass could not undo. Non-empty means a billable
    /// resource may be orphaned.
    pub cleanup_failures: Vec<String>,
}
