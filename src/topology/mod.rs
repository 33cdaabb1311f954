//! Topology discovery. Enumerates NAT gateways, VPC endpoints, and route
//! tables in one pass; everything is immutable once discovered.

use serde::Serialize;
use serde_json::Value;

use crate::error::ScanError;
use crate::ranges::ServiceTag;

/// Whether a NAT gateway is scoped to one availability zone or spans all of
/// them. Decides the flow-log target: zonal gateways are logged through their
/// attached network interface, regional ones through the gateway resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AvailabilityMode {
    Zonal,
    Regional,
}

impl AvailabilityMode {
    fn parse(s: Option<&str>) -> Self {
        match s {
            Some(v) if v.eq_ignore_ascii_case("regional") => AvailabilityMode::Regional,
            _ => AvailabilityMode::Zonal,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NatGateway {
    pub nat_gateway_id: String,
    pub vpc_id: String,
    pub subnet_id: String,
    pub state: String,
    pub connectivity_type: String,
    pub availability_mode: AvailabilityMode,
    /// First attached network interface, if the API reported one.
    pub network_interface_id: Option<String>,
    pub name: Option<String>,
}

impl NatGateway {
    pub fn is_available(&self) -> bool {
        self.state == "available"
    }

    pub fn from_json(value: &Value) -> Option<Self> {
        let id = value["NatGatewayId"].as_str()?;
        let eni = value["NatGatewayAddresses"]
            .as_array()
            .and_then(|addrs| addrs.first())
            .and_then(|a| a["NetworkInterfaceId"].as_str())
            .map(String::from);
        Some(NatGateway {
            nat_gateway_id: id.to_string(),
            vpc_id: value["VpcId"].as_str().unwrap_or_default().to_string(),
            subnet_id: value["SubnetId"].as_str().unwrap_or_default().to_string(),
            state: value["State"].as_str().unwrap_or("unknown").to_string(),
            connectivity_type: value["ConnectivityType"]
                .as_str()
                .unwrap_or("public")
                .to_string(),
            availability_mode: AvailabilityMode::parse(value["AvailabilityMode"].as_str()),
            network_interface_id: eni,
            name: tag_value(value, "Name"),
        })
    }
}

/// Free route-table-attached path vs. billed per-zone-hour path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Gateway,
    Interface,
}

#[derive(Debug, Clone, Serialize)]
pub struct VpcEndpoint {
    pub vpc_endpoint_id: String,
    pub vpc_id: String,
    /// Full service name, e.g. `com.amazonaws.us-east-1.s3`.
    pub service_name: String,
    pub kind: EndpointKind,
    pub state: String,
    pub route_table_ids: Vec<String>,
    pub subnet_ids: Vec<String>,
}

impl VpcEndpoint {
    pub fn from_json(value: &Value) -> Option<Self> {
        let id = value["VpcEndpointId"].as_str()?;
        let kind = match value["VpcEndpointType"].as_str() {
            Some(t) if t.eq_ignore_ascii_case("interface") => EndpointKind::Interface,
            _ => EndpointKind::Gateway,
        };
        Some(VpcEndpoint {
            vpc_endpoint_id: id.to_string(),
            vpc_id: value["VpcId"].as_str().unwrap_or_default().to_string(),
            service_name: value["ServiceName"].as_str().unwrap_or_default().to_string(),
            kind,
            state: value["State"].as_str().unwrap_or("unknown").to_string(),
            route_table_ids: string_array(&value["RouteTableIds"]),
            subnet_ids: string_array(&value["SubnetIds"]),
        })
    }

    /// Which billable service this endpoint fronts, judged by the final
    /// component of the service name.
    pub fn service_tag(&self) -> ServiceTag {
        let last = self.service_name.rsplit('.').next().unwrap_or_default();
        match last {
            "s3" => ServiceTag::S3,
            "dynamodb" => ServiceTag::DynamoDb,
            _ if self.service_name.contains(".ecr.") || self.service_name.ends_with(".ecr") => {
                ServiceTag::ContainerRegistry
            }
            _ => ServiceTag::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteTarget {
    NatGateway(String),
    InternetGateway(String),
    VpcEndpoint(String),
    Local,
    Other(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct Route {
    pub destination: String,
    pub target: RouteTarget,
}

impl Route {
    fn from_json(value: &Value) -> Option<Self> {
        let destination = value["DestinationCidrBlock"]
            .as_str()
            .or_else(|| value["DestinationIpv6CidrBlock"].as_str())
            .or_else(|| value["DestinationPrefixListId"].as_str())?
            .to_string();
        let target = if let Some(nat) = value["NatGatewayId"].as_str() {
            RouteTarget::NatGateway(nat.to_string())
        } else if let Some(gw) = value["GatewayId"].as_str() {
            if gw == "local" {
                RouteTarget::Local
            } else if gw.starts_with("igw-") {
                RouteTarget::InternetGateway(gw.to_string())
            } else if gw.starts_with("vpce-") {
                RouteTarget::VpcEndpoint(gw.to_string())
            } else {
                RouteTarget::Other(gw.to_string())
            }
        } else {
            RouteTarget::Other(
                value["NetworkInterfaceId"]
                    .as_str()
                    .or_else(|| value["TransitGatewayId"].as_str())
                    .unwrap_or("unknown")
                    .to_string(),
            )
        };
        Some(Route { destination, target })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteTable {
    pub route_table_id: String,
    pub vpc_id: String,
    pub routes: Vec<Route>,
    pub subnet_ids: Vec<String>,
    pub main: bool,
}

impl RouteTable {
    pub fn from_json(value: &Value) -> Option<Self> {
        let id = value["RouteTableId"].as_str()?;
        let mut subnet_ids = Vec::new();
        let mut main = false;
        if let Some(assocs) = value["Associations"].as_array() {
            for assoc in assocs {
                if assoc["Main"].as_bool().unwrap_or(false) {
                    main = true;
                }
                if let Some(subnet) = assoc["SubnetId"].as_str() {
                    subnet_ids.push(subnet.to_string());
                }
            }
        }
        let routes = value["Routes"]
            .as_array()
            .map(|rs| rs.iter().filter_map(Route::from_json).collect())
            .unwrap_or_default();
        Some(RouteTable {
            route_table_id: id.to_string(),
            vpc_id: value["VpcId"].as_str().unwrap_or_default().to_string(),
            routes,
            subnet_ids,
            main,
        })
    }

    /// The NAT gateway this table's default route targets, if any. This is
    /// what "routes through the gateway" means everywhere in the tool.
    pub fn default_route_nat_gateway(&self) -> Option<&str> {
        self.routes.iter().find_map(|r| {
            if r.destination == "0.0.0.0/0" {
                if let RouteTarget::NatGateway(id) = &r.target {
                    return Some(id.as_str());
                }
            }
            None
        })
    }
}

fn string_array(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

fn tag_value(value: &Value, key: &str) -> Option<String> {
    value["Tags"].as_array().and_then(|tags| {
        tags.iter().find_map(|t| {
            if t["Key"].as_str() == Some(key) {
                t["Value"].as_str().map(String::from)
            } else {
                None
            }
        })
    })
}

/// Read-only discovery surface, backed by the AWS CLI in production and by
/// fixtures in tests.
pub trait DiscoveryBackend {
    async fn nat_gateways(&self) -> Result<Vec<NatGateway>, ScanError>;
    async fn route_tables(&self) -> Result<Vec<RouteTable>, ScanError>;
    async fn vpc_endpoints(&self) -> Result<Vec<VpcEndpoint>, ScanError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct Topology {
    pub gateways: Vec<NatGateway>,
    pub route_tables: Vec<RouteTable>,
    pub endpoints: Vec<VpcEndpoint>,
}

impl Topology {
    pub fn gateways_in(&self, vpc_id: &str) -> Vec<&NatGateway> {
        self.gateways.iter().filter(|g| g.vpc_id == vpc_id).collect()
    }

    pub fn route_tables_in(&self, vpc_id: &str) -> Vec<&RouteTable> {
        self.route_tables
            .iter()
            .filter(|rt| rt.vpc_id == vpc_id)
            .collect()
    }

    pub fn endpoints_in(&self, vpc_id: &str) -> Vec<&VpcEndpoint> {
        self.endpoints.iter().filter(|e| e.vpc_id == vpc_id).collect()
    }

    pub fn find_gateway(&self, id: &str) -> Option<&NatGateway> {
        self.gateways.iter().find(|g| g.nat_gateway_id == id)
    }
}

/// Enumerate all three resource families once. The result is never refreshed
/// within a run.
pub async fn discover<B: DiscoveryBackend>(backend: &B) -> Result<Topology, ScanError> {
    let gateways = backend.nat_gateways().await?;
    let route_tables = backend.route_tables().await?;
    let endpoints = backend.vpc_endpoints().await?;
    Ok(Topology {
        gateways,
        route_tables,
        endpoints,
    })
}
