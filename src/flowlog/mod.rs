//! Flow-log lifecycle. Creates the temporary logging resource against the
//! right target, polls until delivery is active, and deletes everything on
//! the way out. The target choice is correctness-critical: a zonal gateway is
//! logged through its attached network interface, a regional gateway through
//! the gateway resource itself. The wrong choice yields zero data without any
//! error from the API.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::ScanError;
use crate::stop::StopSignal;
use crate::topology::{AvailabilityMode, NatGateway};

pub const ACTIVATION_POLL_INTERVAL: Duration = Duration::from_secs(15);
pub const ACTIVATION_TIMEOUT: Duration = Duration::from_secs(600);

/// What the flow log attaches to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowLogTarget {
    /// Zonal gateway: log the attached ENI.
    Interface(String),
    /// Regional gateway: log the gateway resource itself.
    Gateway(String),
}

impl FlowLogTarget {
    pub fn for_gateway(gateway: &NatGateway) -> Result<Self, ScanError> {
        match gateway.availability_mode {
            AvailabilityMode::Regional => {
                Ok(FlowLogTarget::Gateway(gateway.nat_gateway_id.clone()))
            }
            AvailabilityMode::Zonal => match &gateway.network_interface_id {
                Some(eni) => Ok(FlowLogTarget::Interface(eni.clone())),
                None => Err(ScanError::precondition(
                    format!(
                        "NAT gateway {} has no attached network interface to log",
                        gateway.nat_gateway_id
                    ),
                    "only gateways in the `available` state can be instrumented",
                )),
            },
        }
    }

    pub fn resource_type(&self) -> &'static str {
        match self {
            FlowLogTarget::Interface(_) => "NetworkInterface",
            FlowLogTarget::Gateway(_) => "NatGateway",
        }
    }

    pub fn resource_id(&self) -> &str {
        match self {
            FlowLogTarget::Interface(id) | FlowLogTarget::Gateway(id) => id,
        }
    }
}

/// Everything needed to create one tagged flow log.
#[derive(Debug, Clone)]
pub struct FlowLogRequest {
    pub target: FlowLogTarget,
    pub log_group: String,
    pub role_arn: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
}

/// Delivery state as reported by the describe call.
#[derive(Debug, Clone, Default)]
pub struct FlowLogStatus {
    pub active: bool,
    pub deliver_error: Option<String>,
}

/// Create/poll/delete surface for the logging resource and its delivery
/// destination.
pub trait FlowLogBackend {
    async fn create_flow_log(&self, request: &FlowLogRequest) -> Result<String, ScanError>;
    async fn flow_log_status(&self, flow_log_id: &str) -> Result<FlowLogStatus, ScanError>;
    async fn delete_flow_logs(&self, flow_log_ids: &[String]) -> Result<(), ScanError>;
    async fn create_log_group(&self, name: &str, run_id: &str) -> Result<(), ScanError>;
    async fn delete_log_group(&self, name: &str) -> Result<(), ScanError>;
}

/// Poll until delivery is active. Fixed interval, hard timeout, and the stop
/// signal can pre-empt any wait; a stop here still leaves the caller holding
/// the created id, so cleanup remains its responsibility.
pub async fn poll_active<B: FlowLogBackend>(
    backend: &B,
    flow_log_id: &str,
    stop: &StopSignal,
) -> Result<(), ScanError> {
    let started = tokio::time::Instant::now();
    let deadline = started + ACTIVATION_TIMEOUT;
    loop {
        if stop.is_stopped() {
            return Err(ScanError::Cancelled);
        }
        let status = backend.flow_log_status(flow_log_id).await?;
        if let Some(err) = status.deliver_error {
            return Err(ScanError::ResourceCreation(format!(
                "flow log {} cannot deliver: {}",
                flow_log_id, err
            )));
        }
        if status.active {
            return Ok(());
        }
        if tokio::time::Instant::now() + ACTIVATION_POLL_INTERVAL > deadline {
            return Err(ScanError::ActivationTimeout {
                flow_log_id: flow_log_id.to_string(),
                waited: started.elapsed(),
            });
        }
        if !stop.sleep(ACTIVATION_POLL_INTERVAL).await {
            return Err(ScanError::Cancelled);
        }
    }
}

/// Best-effort deletion of the flow logs a run created. Failures are
/// collected and reported, never raised. The log group has its own retention
/// decision and is settled separately.
pub async fn delete_all<B: FlowLogBackend>(backend: &B, flow_log_ids: &[String]) -> Vec<String> {
    let mut failures = Vec::new();
    if !flow_log_ids.is_empty()
        && let Err(e) = backend.delete_flow_logs(flow_log_ids).await
    {
        failures.push(format!(
            "failed to delete flow log(s) {}: {}",
            flow_log_ids.join(", "),
            e
        ));
    }
    failures
}
