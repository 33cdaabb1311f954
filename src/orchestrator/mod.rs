//! Scan orchestration. Drives one diagnostic run through its phases, gates on
//! explicit approval before anything billable exists, and guarantees that
//! every created resource is deleted on every exit path — success, downstream
//! error, or interrupt. Cleanup failures are reported loudly and appended to
//! the primary error, never swallowed and never allowed to mask it.

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::analysis::{self, QueryBackend, TrafficStatistics};
use crate::collect::collect_window;
use crate::cost::{self, CostEstimate};
use crate::error::ScanError;
use crate::flowlog::{
    self, FlowLogBackend, FlowLogRequest, FlowLogTarget,
};
use crate::metrics::{self, MetricsBackend};
use crate::ranges::RangeClassifier;
use crate::remediation::{self, EndpointAnalysis};
use crate::report::ScanReport;
use crate::stop::StopSignal;
use crate::topology::{self, DiscoveryBackend, NatGateway};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanPhase {
    Init,
    Discover,
    SelectTarget,
    AwaitApproval,
    CreateResources,
    AwaitActivation,
    Collect,
    Analyze,
    StopResources,
    AwaitRetentionDecision,
    Done,
    Failed,
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanPhase::Init => "init",
            ScanPhase::Discover => "discover",
            ScanPhase::SelectTarget => "select-target",
            ScanPhase::AwaitApproval => "await-approval",
            ScanPhase::CreateResources => "create-resources",
            ScanPhase::AwaitActivation => "await-activation",
            ScanPhase::Collect => "collect",
            ScanPhase::Analyze => "analyze",
            ScanPhase::StopResources => "stop-resources",
            ScanPhase::AwaitRetentionDecision => "await-retention-decision",
            ScanPhase::Done => "done",
            ScanPhase::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
pub enum ScanEvent {
    Phase(ScanPhase),
    Progress {
        phase: ScanPhase,
        elapsed: Duration,
        remaining: Duration,
    },
    Info(String),
    Warning(String),
}

/// What the user is asked to keep or delete after the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionChoice {
    Keep,
    Delete,
}

/// Shown at the approval gate before anything billable is created.
#[derive(Debug, Clone)]
pub struct SpendPreview {
    pub gateway_id: String,
    pub duration_minutes: u64,
    pub expected_sample_gb: f64,
    pub estimate_from_metrics: bool,
}

/// Interaction seam. Implemented over stdin by the binary; tests script it.
pub trait Prompter {
    async fn approve_spend(&self, preview: &SpendPreview) -> bool;
    async fn retention(&self, log_group: &str) -> RetentionChoice;
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub region: String,
    pub duration_minutes: u64,
    pub gateway_id: Option<String>,
    pub role_arn: String,
    pub assume_yes: bool,
    pub retention_override: Option<RetentionChoice>,
}

/// A failed run: the error, the phase it happened in, and whatever cleanup
/// could not be undone afterwards.
#[derive(Debug)]
pub struct ScanFailure {
    pub phase: ScanPhase,
    pub error: ScanError,
    pub cleanup_failures: Vec<String>,
}

impl fmt::Display for ScanFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scan failed during {}: {}", self.phase, self.error)?;
        if !self.cleanup_failures.is_empty() {
            write!(
                f,
                " ({} cleanup failure(s); resources may be orphaned)",
                self.cleanup_failures.len()
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for ScanFailure {}

struct PipelineOutput {
    gateway: NatGateway,
    window_minutes: u64,
    statistics: TrafficStatistics,
    estimate: CostEstimate,
    endpoint_analysis: EndpointAnalysis,
}

pub struct Orchestrator<'a, B, P> {
    backend: &'a B,
    prompter: &'a P,
    classifier: RangeClassifier,
    config: ScanConfig,
    stop: StopSignal,
    events: mpsc::Sender<ScanEvent>,
    run_id: String,
    phase: ScanPhase,
    flow_log_ids: Vec<String>,
    log_group: Option<String>,
}

impl<'a, B, P> Orchestrator<'a, B, P>
where
    B: DiscoveryBackend + FlowLogBackend + QueryBackend + MetricsBackend,
    P: Prompter,
{
    pub fn new(
        backend: &'a B,
        prompter: &'a P,
        classifier: RangeClassifier,
        config: ScanConfig,
        stop: StopSignal,
        events: mpsc::Sender<ScanEvent>,
    ) -> Self {
        Orchestrator {
            backend,
            prompter,
            classifier,
            config,
            stop,
            events,
            run_id: Uuid::new_v4().to_string(),
            phase: ScanPhase::Init,
            flow_log_ids: Vec::new(),
            log_group: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    async fn set_phase(&mut self, phase: ScanPhase) {
        self.phase = phase;
        let _ = self.events.send(ScanEvent::Phase(phase)).await;
    }

    async fn info(&self, message: impl Into<String>) {
        let _ = self.events.send(ScanEvent::Info(message.into())).await;
    }

    async fn warn(&self, message: impl Into<String>) {
        let _ = self.events.send(ScanEvent::Warning(message.into())).await;
    }

    /// Run the scan to completion. Whatever happens inside the pipeline, the
    /// stop-resources pass below it always runs.
    pub async fn run(mut self) -> Result<ScanReport, ScanFailure> {
        let started_at = Utc::now();
        let result = self.run_pipeline().await;
        let failed_phase = self.phase;

        self.set_phase(ScanPhase::StopResources).await;
        let mut cleanup_failures = flowlog::delete_all(self.backend, &self.flow_log_ids).await;
        if self.flow_log_ids.is_empty() {
            self.info("no flow logs to remove").await;
        } else if cleanup_failures.is_empty() {
            self.info(format!(
                "removed flow log(s) {}",
                self.flow_log_ids.join(", ")
            ))
            .await;
        }

        let log_group_kept = self.settle_log_group(result.is_ok(), &mut cleanup_failures).await;
        for failure in &cleanup_failures {
            self.warn(failure.clone()).await;
        }

        match result {
            Ok(output) => {
                self.set_phase(ScanPhase::Done).await;
                Ok(ScanReport {
                    run_id: self.run_id,
                    region: self.config.region,
                    gateway_id: output.gateway.nat_gateway_id,
                    vpc_id: output.gateway.vpc_id,
                    window_minutes: output.window_minutes,
                    started_at,
                    finished_at: Utc::now(),
                    statistics: output.statistics,
                    estimate: output.estimate,
                    endpoint_analysis: output.endpoint_analysis,
                    log_group: self.log_group,
                    log_group_kept,
                    cleanup_failures,
                })
            }
            Err(error) => {
                self.set_phase(ScanPhase::Failed).await;
                Err(ScanFailure {
                    phase: failed_phase,
                    error,
                    cleanup_failures,
                })
            }
        }
    }

    async fn run_pipeline(&mut self) -> Result<PipelineOutput, ScanError> {
        self.set_phase(ScanPhase::Init).await;
        self.validate_config()?;

        self.set_phase(ScanPhase::Discover).await;
        let topology = topology::discover(self.backend).await?;
        self.info(format!(
            "found {} NAT gateway(s), {} route table(s), {} endpoint(s)",
            topology.gateways.len(),
            topology.route_tables.len(),
            topology.endpoints.len()
        ))
        .await;

        self.set_phase(ScanPhase::SelectTarget).await;
        let gateway = self.select_gateway(&topology)?.clone();
        let target = FlowLogTarget::for_gateway(&gateway)?;
        self.info(format!(
            "target: {} ({} {})",
            gateway.nat_gateway_id,
            target.resource_type(),
            target.resource_id()
        ))
        .await;

        self.set_phase(ScanPhase::AwaitApproval).await;
        let volume = metrics::estimate_hourly_bytes(self.backend, &gateway.nat_gateway_id).await;
        if !volume.from_metrics {
            self.warn("traffic metric unavailable; assuming 1 GB/hour for the preview")
                .await;
        }
        let preview = SpendPreview {
            gateway_id: gateway.nat_gateway_id.clone(),
            duration_minutes: self.config.duration_minutes,
            expected_sample_gb: volume.sample_bytes(self.config.duration_minutes)
                / 1_073_741_824.0,
            estimate_from_metrics: volume.from_metrics,
        };
        if self.config.assume_yes {
            self.info("approval gate skipped (--yes)").await;
        } else if !self.prompter.approve_spend(&preview).await {
            self.info("declined; nothing was created").await;
            return Err(ScanError::Cancelled);
        }
        if self.stop.is_stopped() {
            return Err(ScanError::Cancelled);
        }

        self.set_phase(ScanPhase::CreateResources).await;
        let created_at = Utc::now();
        let log_group = format!("/natscout/{}", self.run_id);
        self.backend
            .create_log_group(&log_group, &self.run_id)
            .await
            .map_err(|e| ScanError::ResourceCreation(e.to_string()))?;
        // Anything past this point is must-cleanup territory.
        self.log_group = Some(log_group.clone());
        let request = FlowLogRequest {
            target,
            log_group: log_group.clone(),
            role_arn: self.config.role_arn.clone(),
            run_id: self.run_id.clone(),
            created_at,
        };
        let flow_log_id = self.backend.create_flow_log(&request).await?;
        self.flow_log_ids.push(flow_log_id.clone());
        self.info(format!("created flow log {}", flow_log_id)).await;

        self.set_phase(ScanPhase::AwaitActivation).await;
        flowlog::poll_active(self.backend, &flow_log_id, &self.stop).await?;
        self.info("flow log delivery is active").await;

        self.set_phase(ScanPhase::Collect).await;
        let window = Duration::from_secs(self.config.duration_minutes * 60);
        collect_window(window, &self.stop, &self.events).await?;
        let window_end = Utc::now();

        self.set_phase(ScanPhase::Analyze).await;
        let statistics = analysis::analyze(
            self.backend,
            &self.classifier,
            &log_group,
            created_at,
            window_end,
            &self.stop,
            &self.events,
        )
        .await?;
        let estimate = cost::project(
            &statistics,
            self.config.duration_minutes,
            &self.config.region,
        );
        let endpoint_analysis = remediation::analyze(
            &gateway.vpc_id,
            &self.config.region,
            &topology.gateways_in(&gateway.vpc_id),
            &topology.endpoints_in(&gateway.vpc_id),
            &topology.route_tables_in(&gateway.vpc_id),
        );

        Ok(PipelineOutput {
            window_minutes: self.config.duration_minutes,
            gateway,
            statistics,
            estimate,
            endpoint_analysis,
        })
    }

    fn validate_config(&self) -> Result<(), ScanError> {
        if self.config.region.is_empty() {
            return Err(ScanError::precondition(
                "no region configured",
                "pass --region or set AWS_REGION",
            ));
        }
        if !(5..=60).contains(&self.config.duration_minutes) {
            return Err(ScanError::precondition(
                format!(
                    "collection window of {} minutes is out of range",
                    self.config.duration_minutes
                ),
                "choose a window between 5 and 60 minutes",
            ));
        }
        if self.config.role_arn.is_empty() {
            return Err(ScanError::precondition(
                "no flow-log delivery role configured",
                "pass --role-arn with a role trusted by vpc-flow-logs.amazonaws.com",
            ));
        }
        Ok(())
    }

    fn select_gateway<'t>(
        &self,
        topology: &'t topology::Topology,
    ) -> Result<&'t NatGateway, ScanError> {
        if let Some(wanted) = &self.config.gateway_id {
            let gateway = topology.find_gateway(wanted).ok_or_else(|| {
                ScanError::precondition(
                    format!("NAT gateway {} not found in {}", wanted, self.config.region),
                    "check the id and region",
                )
            })?;
            if !gateway.is_available() {
                return Err(ScanError::precondition(
                    format!("NAT gateway {} is in state {}", wanted, gateway.state),
                    "only `available` gateways can be instrumented",
                ));
            }
            return Ok(gateway);
        }
        let available: Vec<&NatGateway> = topology
            .gateways
            .iter()
            .filter(|g| g.is_available())
            .collect();
        match available.len() {
            0 => Err(ScanError::precondition(
                format!("no available NAT gateways in {}", self.config.region),
                "nothing to diagnose; NAT spend in this region is zero",
            )),
            1 => Ok(available[0]),
            _ => {
                let ids: Vec<&str> = available
                    .iter()
                    .map(|g| g.nat_gateway_id.as_str())
                    .collect();
                Err(ScanError::precondition(
                    format!("multiple NAT gateways found: {}", ids.join(", ")),
                    "pick one with --gateway",
                ))
            }
        }
    }

    /// Retention decision for the delivery destination. The log group is
    /// deliberately not auto-deleted: on a successful interactive run the
    /// user decides; on failure or interrupt it is kept for inspection (its
    /// 1-day retention bounds the storage cost either way).
    async fn settle_log_group(
        &mut self,
        run_succeeded: bool,
        cleanup_failures: &mut Vec<String>,
    ) -> bool {
        let Some(group) = self.log_group.clone() else {
            return false;
        };
        // The decision phase is only entered when a decision is actually
        // made: an explicit override or an interactive prompt. Failed,
        // interrupted, and non-interactive runs default to keeping the group
        // without passing through it.
        let choice = match self.config.retention_override {
            Some(choice) => {
                self.set_phase(ScanPhase::AwaitRetentionDecision).await;
                choice
            }
            None if !run_succeeded || self.stop.is_stopped() => RetentionChoice::Keep,
            None if self.config.assume_yes => RetentionChoice::Keep,
            None => {
                self.set_phase(ScanPhase::AwaitRetentionDecision).await;
                self.prompter.retention(&group).await
            }
        };
        match choice {
            RetentionChoice::Delete => {
                match self.backend.delete_log_group(&group).await {
                    Ok(()) => {
                        self.info(format!("deleted log group {}", group)).await;
                        false
                    }
                    Err(e) => {
                        cleanup_failures
                            .push(format!("failed to delete log group {}: {}", group, e));
                        true
                    }
                }
            }
            RetentionChoice::Keep => {
                self.info(format!(
                    "kept log group {} (expires via 1-day retention)",
                    group
                ))
                .await;
                true
            }
        }
    }
}
