//! Endpoint remediation analysis. Cross-references existing VPC endpoints
//! against the route tables that send traffic through a NAT gateway, and
//! synthesizes the fix for each gap. Pure and deterministic: identical input
//! yields identical findings.

use serde::Serialize;

use crate::ranges::ServiceTag;
use crate::topology::{EndpointKind, NatGateway, RouteTable, VpcEndpoint};

/// Interface endpoints bill per zone-hour on top of per-GB processing.
pub const INTERFACE_ENDPOINT_HOURLY: f64 = 0.01;
pub const HOURS_PER_MONTH: f64 = 730.0;

/// Services that support the free, route-table-attached gateway endpoint.
const GATEWAY_ENDPOINT_SERVICES: [ServiceTag; 2] = [ServiceTag::S3, ServiceTag::DynamoDb];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Finding {
    /// No gateway endpoint for the service exists in the VPC at all.
    MissingEndpoint {
        vpc_id: String,
        service: ServiceTag,
        remediation: String,
    },
    /// The endpoint exists but a NAT-routed table is not associated with it,
    /// so that table's subnets still pay the gateway rate. Distinct from a
    /// missing endpoint because the fix is an association, not a creation.
    MissingAssociation {
        vpc_id: String,
        service: ServiceTag,
        endpoint_id: String,
        route_table_id: String,
        remediation: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceEndpointCost {
    pub endpoint_id: String,
    pub service_name: String,
    pub zone_count: usize,
    /// True when the association count was unknown and one zone was assumed.
    pub assumed_single_zone: bool,
    pub monthly_hourly_cost: f64,
}

/// Per-VPC findings. Immutable result object.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointAnalysis {
    pub vpc_id: String,
    pub findings: Vec<Finding>,
    pub interface_costs: Vec<InterfaceEndpointCost>,
}

impl EndpointAnalysis {
    fn empty(vpc_id: &str) -> Self {
        EndpointAnalysis {
            vpc_id: vpc_id.to_string(),
            findings: Vec::new(),
            interface_costs: Vec::new(),
        }
    }
}

/// Analyze one VPC. Findings only fire when the VPC has at least one NAT
/// gateway and at least one route table whose default route targets it;
/// otherwise there is no NAT spend to remediate.
pub fn analyze(
    vpc_id: &str,
    region: &str,
    gateways: &[&NatGateway],
    endpoints: &[&VpcEndpoint],
    route_tables: &[&RouteTable],
) -> EndpointAnalysis {
    let nat_ids: Vec<&str> = gateways
        .iter()
        .filter(|g| g.vpc_id == vpc_id)
        .map(|g| g.nat_gateway_id.as_str())
        .collect();
    let nat_routed: Vec<&RouteTable> = route_tables
        .iter()
        .filter(|rt| rt.vpc_id == vpc_id)
        .filter(|rt| {
            rt.default_route_nat_gateway()
                .is_some_and(|nat| nat_ids.contains(&nat))
        })
        .copied()
        .collect();
    if nat_ids.is_empty() || nat_routed.is_empty() {
        return EndpointAnalysis::empty(vpc_id);
    }

    let mut analysis = EndpointAnalysis::empty(vpc_id);

    for service in GATEWAY_ENDPOINT_SERVICES {
        let existing: Vec<&&VpcEndpoint> = endpoints
            .iter()
            .filter(|e| {
                e.vpc_id == vpc_id && e.kind == EndpointKind::Gateway && e.service_tag() == service
            })
            .collect();

        if existing.is_empty() {
            let table_ids: Vec<&str> = nat_routed
                .iter()
                .map(|rt| rt.route_table_id.as_str())
                .collect();
            analysis.findings.push(Finding::MissingEndpoint {
                vpc_id: vpc_id.to_string(),
                service,
                remediation: format!(
                    "aws ec2 create-vpc-endpoint --vpc-id {} --service-name com.amazonaws.{}.{} --route-table-ids {}",
                    vpc_id,
                    region,
                    service_suffix(service),
                    table_ids.join(" ")
                ),
            });
            continue;
        }

        for table in &nat_routed {
            let covered = existing
                .iter()
                .any(|e| e.route_table_ids.contains(&table.route_table_id));
            if !covered {
                let endpoint_id = existing[0].vpc_endpoint_id.clone();
                analysis.findings.push(Finding::MissingAssociation {
                    vpc_id: vpc_id.to_string(),
                    service,
                    endpoint_id: endpoint_id.clone(),
                    route_table_id: table.route_table_id.clone(),
                    remediation: format!(
                        "aws ec2 modify-vpc-endpoint --vpc-endpoint-id {} --add-route-table-ids {}",
                        endpoint_id, table.route_table_id
                    ),
                });
            }
        }
    }

    for endpoint in endpoints
        .iter()
        .filter(|e| e.vpc_id == vpc_id && e.kind == EndpointKind::Interface)
    {
        // Zone count is approximated by the associated-subnet count; when the
        // API reports none, assume a single zone rather than zero cost.
        let known = endpoint.subnet_ids.len();
        let assumed_single_zone = known == 0;
        let zone_count = if assumed_single_zone { 1 } else { known };
        analysis.interface_costs.push(InterfaceEndpointCost {
            endpoint_id: endpoint.vpc_endpoint_id.clone(),
            service_name: endpoint.service_name.clone(),
            zone_count,
            assumed_single_zone,
            monthly_hourly_cost: zone_count as f64 * INTERFACE_ENDPOINT_HOURLY * HOURS_PER_MONTH,
        });
    }

    analysis
}

fn service_suffix(service: ServiceTag) -> &'static str {
    match service {
        ServiceTag::S3 => "s3",
        ServiceTag::DynamoDb => "dynamodb",
        ServiceTag::ContainerRegistry => "ecr.api",
        ServiceTag::Other => "other",
    }
}
