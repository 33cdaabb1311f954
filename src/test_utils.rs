//! Shared test fixtures: builders for topology objects and an in-memory cloud
//! backend that scripts every external surface the engines touch.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::analysis::{QueryBackend, QueryPoll, QueryRow, TrafficStatistics};
use crate::error::ScanError;
use crate::flowlog::{FlowLogBackend, FlowLogRequest, FlowLogStatus};
use crate::metrics::MetricsBackend;
use crate::ranges::{RangeClassifier, ServiceTag};
use crate::stop::StopHandle;
use crate::topology::{
    AvailabilityMode, DiscoveryBackend, EndpointKind, NatGateway, Route, RouteTable, RouteTarget,
    VpcEndpoint,
};

pub fn nat_gateway(id: &str, vpc_id: &str, eni: Option<&str>) -> NatGateway {
    NatGateway {
        nat_gateway_id: id.to_string(),
        vpc_id: vpc_id.to_string(),
        subnet_id: "subnet-fixture".to_string(),
        state: "available".to_string(),
        connectivity_type: "public".to_string(),
        availability_mode: AvailabilityMode::Zonal,
        network_interface_id: eni.map(String::from),
        name: None,
    }
}

pub fn regional_nat_gateway(id: &str, vpc_id: &str) -> NatGateway {
    NatGateway {
        availability_mode: AvailabilityMode::Regional,
        network_interface_id: None,
        ..nat_gateway(id, vpc_id, None)
    }
}

/// Route table whose default route targets the given NAT gateway.
pub fn nat_routed_table(id: &str, vpc_id: &str, nat_id: &str) -> RouteTable {
    RouteTable {
        route_table_id: id.to_string(),
        vpc_id: vpc_id.to_string(),
        routes: vec![
            Route {
                destination: "10.0.0.0/16".to_string(),
                target: RouteTarget::Local,
            },
            Route {
                destination: "0.0.0.0/0".to_string(),
                target: RouteTarget::NatGateway(nat_id.to_string()),
            },
        ],
        subnet_ids: vec![format!("{}-subnet", id)],
        main: false,
    }
}

pub fn plain_table(id: &str, vpc_id: &str) -> RouteTable {
    RouteTable {
        route_table_id: id.to_string(),
        vpc_id: vpc_id.to_string(),
        routes: vec![Route {
            destination: "10.0.0.0/16".to_string(),
            target: RouteTarget::Local,
        }],
        subnet_ids: Vec::new(),
        main: true,
    }
}

pub fn gateway_endpoint(id: &str, vpc_id: &str, service: &str, route_tables: &[&str]) -> VpcEndpoint {
    VpcEndpoint {
        vpc_endpoint_id: id.to_string(),
        vpc_id: vpc_id.to_string(),
        service_name: format!("com.amazonaws.us-east-1.{}", service),
        kind: EndpointKind::Gateway,
        state: "available".to_string(),
        route_table_ids: route_tables.iter().map(|s| s.to_string()).collect(),
        subnet_ids: Vec::new(),
    }
}

pub fn interface_endpoint(id: &str, vpc_id: &str, service: &str, subnets: &[&str]) -> VpcEndpoint {
    VpcEndpoint {
        vpc_endpoint_id: id.to_string(),
        vpc_id: vpc_id.to_string(),
        service_name: format!("com.amazonaws.us-east-1.{}", service),
        kind: EndpointKind::Interface,
        state: "available".to_string(),
        route_table_ids: Vec::new(),
        subnet_ids: subnets.iter().map(|s| s.to_string()).collect(),
    }
}

/// Classifier over fixed prefixes: one registry host, one S3 block, one
/// DynamoDB block.
pub fn classifier_fixture() -> RangeClassifier {
    RangeClassifier::from_sets(
        vec!["52.119.100.10/32".parse().unwrap()],
        vec!["52.216.0.0/15".parse().unwrap()],
        vec!["52.94.0.0/22".parse().unwrap()],
    )
}

/// One aggregation-result row as the query API shapes it.
pub fn insights_row(dst: &str, bytes: u64, records: u64) -> QueryRow {
    vec![
        ("dstAddr".to_string(), dst.to_string()),
        ("totalBytes".to_string(), bytes.to_string()),
        ("recordCount".to_string(), records.to_string()),
    ]
}

/// One raw flow-record message in the positional v2 format.
pub fn raw_record(src: &str, dst: &str, bytes: u64, action: &str) -> String {
    format!(
        "2 123456789012 eni-fixture {} {} 44321 443 6 10 {} 1600000000 1600000060 {} OK",
        src, dst, bytes, action
    )
}

/// Statistics with the given per-service byte counts (one record each).
pub fn stats_with(services: &[(ServiceTag, u64)]) -> TrafficStatistics {
    let mut by_service = std::collections::BTreeMap::new();
    for tag in ServiceTag::ALL {
        by_service.insert(tag, 0);
    }
    let mut total_bytes = 0;
    for (tag, bytes) in services {
        *by_service.get_mut(tag).unwrap() += bytes;
        total_bytes += bytes;
    }
    TrafficStatistics {
        total_bytes,
        total_records: services.len() as u64,
        by_service,
        top_sources: Vec::new(),
        from_fallback: false,
    }
}

#[derive(Default)]
struct FakeCloudState {
    gateways: Vec<NatGateway>,
    route_tables: Vec<RouteTable>,
    endpoints: Vec<VpcEndpoint>,

    // Flow-log lifecycle.
    create_counter: usize,
    created_flow_logs: Vec<String>,
    last_request: Option<(String, String)>,
    deleted_flow_logs: Vec<String>,
    created_groups: Vec<String>,
    deleted_groups: Vec<String>,
    fail_deletes: bool,
    fail_create: Option<String>,

    // Activation polling.
    status_calls: usize,
    activation_after: usize,
    never_active: bool,
    deliver_error: Option<String>,
    stop_on_status: Option<(StopHandle, usize)>,

    // Queries.
    query_rows: VecDeque<Vec<QueryRow>>,
    raw_messages: Vec<String>,
    fail_query: Option<String>,

    // Metrics.
    metric_bytes: Option<f64>,
    fail_metrics: bool,
}

/// In-memory stand-in for every cloud surface, scriptable per test.
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<FakeCloudState>,
}

impl FakeCloud {
    pub fn with_topology(
        gateways: Vec<NatGateway>,
        route_tables: Vec<RouteTable>,
        endpoints: Vec<VpcEndpoint>,
    ) -> Self {
        let cloud = FakeCloud::default();
        {
            let mut state = cloud.state.lock().unwrap();
            state.gateways = gateways;
            state.route_tables = route_tables;
            state.endpoints = endpoints;
        }
        cloud
    }

    pub fn set_activation_after(&self, polls: usize) {
        self.state.lock().unwrap().activation_after = polls;
    }

    pub fn set_never_active(&self) {
        self.state.lock().unwrap().never_active = true;
    }

    pub fn set_deliver_error(&self, message: &str) {
        self.state.lock().unwrap().deliver_error = Some(message.to_string());
    }

    /// Trigger the stop signal when the n-th status poll arrives, to script a
    /// cancellation mid-activation deterministically.
    pub fn stop_on_status_call(&self, handle: StopHandle, call: usize) {
        self.state.lock().unwrap().stop_on_status = Some((handle, call));
    }

    pub fn status_calls(&self) -> usize {
        self.state.lock().unwrap().status_calls
    }

    pub fn fail_deletes(&self) {
        self.state.lock().unwrap().fail_deletes = true;
    }

    pub fn fail_create_flow_log(&self, message: &str) {
        self.state.lock().unwrap().fail_create = Some(message.to_string());
    }

    pub fn created_flow_logs(&self) -> Vec<String> {
        self.state.lock().unwrap().created_flow_logs.clone()
    }

    pub fn deleted_flow_logs(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_flow_logs.clone()
    }

    pub fn created_groups(&self) -> Vec<String> {
        self.state.lock().unwrap().created_groups.clone()
    }

    pub fn deleted_groups(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_groups.clone()
    }

    /// Resource type and id of the last flow-log create call.
    pub fn last_flow_log_target(&self) -> Option<(String, String)> {
        self.state.lock().unwrap().last_request.clone()
    }

    pub fn push_query_rows(&self, rows: Vec<QueryRow>) {
        self.state.lock().unwrap().query_rows.push_back(rows);
    }

    pub fn push_raw_messages(&self, messages: Vec<String>) {
        self.state.lock().unwrap().raw_messages = messages;
    }

    pub fn fail_queries(&self, message: &str) {
        self.state.lock().unwrap().fail_query = Some(message.to_string());
    }

    pub fn set_metric_bytes(&self, bytes: f64) {
        self.state.lock().unwrap().metric_bytes = Some(bytes);
    }

    pub fn fail_metrics(&self) {
        self.state.lock().unwrap().fail_metrics = true;
    }
}

impl DiscoveryBackend for FakeCloud {
    async fn nat_gateways(&self) -> Result<Vec<NatGateway>, ScanError> {
        Ok(self.state.lock().unwrap().gateways.clone())
    }

    async fn route_tables(&self) -> Result<Vec<RouteTable>, ScanError> {
        Ok(self.state.lock().unwrap().route_tables.clone())
    }

    async fn vpc_endpoints(&self) -> Result<Vec<VpcEndpoint>, ScanError> {
        Ok(self.state.lock().unwrap().endpoints.clone())
    }
}

impl FlowLogBackend for FakeCloud {
    async fn create_flow_log(&self, request: &FlowLogRequest) -> Result<String, ScanError> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = &state.fail_create {
            return Err(ScanError::ResourceCreation(message.clone()));
        }
        state.create_counter += 1;
        let id = format!("fl-fake-{}", state.create_counter);
        state.created_flow_logs.push(id.clone());
        state.last_request = Some((
            request.target.resource_type().to_string(),
            request.target.resource_id().to_string(),
        ));
        Ok(id)
    }

    async fn flow_log_status(&self, _flow_log_id: &str) -> Result<FlowLogStatus, ScanError> {
        let mut state = self.state.lock().unwrap();
        state.status_calls += 1;
        if let Some((handle, call)) = &state.stop_on_status
            && state.status_calls >= *call
        {
            handle.stop();
        }
        if let Some(err) = &state.deliver_error {
            return Ok(FlowLogStatus {
                active: false,
                deliver_error: Some(err.clone()),
            });
        }
        let active = !state.never_active && state.status_calls > state.activation_after;
        Ok(FlowLogStatus {
            active,
            deliver_error: None,
        })
    }

    async fn delete_flow_logs(&self, flow_log_ids: &[String]) -> Result<(), ScanError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_deletes {
            return Err(ScanError::Aws {
                command: "ec2 delete-flow-logs".to_string(),
                message: "scripted failure".to_string(),
            });
        }
        state.deleted_flow_logs.extend(flow_log_ids.iter().cloned());
        Ok(())
    }

    async fn create_log_group(&self, name: &str, _run_id: &str) -> Result<(), ScanError> {
        self.state.lock().unwrap().created_groups.push(name.to_string());
        Ok(())
    }

    async fn delete_log_group(&self, name: &str) -> Result<(), ScanError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_deletes {
            return Err(ScanError::Aws {
                command: "logs delete-log-group".to_string(),
                message: "scripted failure".to_string(),
            });
        }
        state.deleted_groups.push(name.to_string());
        Ok(())
    }
}

impl QueryBackend for FakeCloud {
    async fn start_query(
        &self,
        _log_group: &str,
        _query: &str,
        _start: i64,
        _end: i64,
    ) -> Result<String, ScanError> {
        Ok("q-fake".to_string())
    }

    async fn query_results(&self, _query_id: &str) -> Result<QueryPoll, ScanError> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = &state.fail_query {
            return Ok(QueryPoll::Failed(message.clone()));
        }
        let rows = state.query_rows.pop_front().unwrap_or_default();
        Ok(QueryPoll::Complete(rows))
    }

    async fn raw_messages(
        &self,
        _log_group: &str,
        _start: i64,
        _end: i64,
    ) -> Result<Vec<String>, ScanError> {
        Ok(self.state.lock().unwrap().raw_messages.clone())
    }
}

impl MetricsBackend for FakeCloud {
    async fn nat_bytes_out(
        &self,
        _gateway_id: &str,
        _start_epoch: i64,
        _end_epoch: i64,
    ) -> Result<f64, ScanError> {
        let state = self.state.lock().unwrap();
        if state.fail_metrics {
            return Err(ScanError::Query("metrics unavailable".to_string()));
        }
        Ok(state.metric_bytes.unwrap_or(0.0))
    }
}
