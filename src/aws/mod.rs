//! AWS access through the `aws` CLI. Every call shells out with
//! `--output json` and parses the result; a missing binary or missing
//! credentials surface as precondition errors with a remediation hint,
//! anything else as a tagged command failure.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::process::Command;

use crate::analysis::{QueryBackend, QueryPoll, QueryRow};
use crate::error::ScanError;
use crate::flowlog::{FlowLogBackend, FlowLogRequest, FlowLogStatus};
use crate::metrics::MetricsBackend;
use crate::topology::{DiscoveryBackend, NatGateway, RouteTable, VpcEndpoint};

/// Tag keys stamped on every created resource so an orphan is attributable
/// even if cleanup is defeated by a hard kill.
pub const RUN_TAG_KEY: &str = "natscout:run";
pub const CREATED_TAG_KEY: &str = "natscout:created";

const RAW_EVENT_PAGE_LIMIT: usize = 10;

pub struct AwsCli {
    region: String,
    profile: Option<String>,
}

impl AwsCli {
    pub fn new(region: impl Into<String>, profile: Option<String>) -> Self {
        AwsCli {
            region: region.into(),
            profile,
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    async fn call(&self, args: &[&str]) -> Result<Value, ScanError> {
        let mut cmd = Command::new("aws");
        cmd.arg("--region")
            .arg(&self.region)
            .arg("--output")
            .arg("json");
        if let Some(profile) = &self.profile {
            cmd.arg("--profile").arg(profile);
        }
        cmd.args(args);
        cmd.kill_on_drop(true);

        let command = args.iter().take(2).cloned().collect::<Vec<_>>().join(" ");
        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ScanError::precondition(
                    "the `aws` CLI is not installed or not on PATH",
                    "install the AWS CLI v2 and re-run",
                )
            } else {
                ScanError::Aws {
                    command: command.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify_cli_error(&command, &stderr));
        }
        if output.stdout.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&output.stdout).map_err(|e| ScanError::Aws {
            command,
            message: format!("unparsable JSON output: {}", e),
        })
    }
}

fn classify_cli_error(command: &str, stderr: &str) -> ScanError {
    if stderr.contains("Unable to locate credentials")
        || stderr.contains("ExpiredToken")
        || stderr.contains("InvalidClientTokenId")
    {
        return ScanError::precondition(
            format!("aws {}: credentials missing or expired", command),
            "run `aws configure` or refresh your SSO/session credentials",
        );
    }
    if stderr.contains("AccessDenied") || stderr.contains("UnauthorizedOperation") {
        return ScanError::precondition(
            format!("aws {}: access denied", command),
            "the calling identity needs ec2:Describe*, ec2:*FlowLogs, logs:*, and cloudwatch:GetMetricStatistics",
        );
    }
    ScanError::Aws {
        command: command.to_string(),
        message: stderr.to_string(),
    }
}

impl DiscoveryBackend for AwsCli {
    async fn nat_gateways(&self) -> Result<Vec<NatGateway>, ScanError> {
        let value = self.call(&["ec2", "describe-nat-gateways"]).await?;
        Ok(json_items(&value, "NatGateways", NatGateway::from_json))
    }

    async fn route_tables(&self) -> Result<Vec<RouteTable>, ScanError> {
        let value = self.call(&["ec2", "describe-route-tables"]).await?;
        Ok(json_items(&value, "RouteTables", RouteTable::from_json))
    }

    async fn vpc_endpoints(&self) -> Result<Vec<VpcEndpoint>, ScanError> {
        let value = self.call(&["ec2", "describe-vpc-endpoints"]).await?;
        Ok(json_items(&value, "VpcEndpoints", VpcEndpoint::from_json))
    }
}

impl FlowLogBackend for AwsCli {
    async fn create_flow_log(&self, request: &FlowLogRequest) -> Result<String, ScanError> {
        let tag_spec = flow_log_tag_spec(&request.run_id, &request.created_at.to_rfc3339());
        let value = self
            .call(&[
                "ec2",
                "create-flow-logs",
                "--resource-type",
                request.target.resource_type(),
                "--resource-ids",
                request.target.resource_id(),
                "--traffic-type",
                "ALL",
                "--log-destination-type",
                "cloud-watch-logs",
                "--log-group-name",
                &request.log_group,
                "--deliver-logs-permission-arn",
                &request.role_arn,
                "--max-aggregation-interval",
                "60",
                "--tag-specifications",
                &tag_spec,
            ])
            .await?;

        if let Some(unsuccessful) = value["Unsuccessful"].as_array()
            && !unsuccessful.is_empty()
        {
            let message = unsuccessful[0]["Error"]["Message"]
                .as_str()
                .unwrap_or("unspecified error");
            return Err(ScanError::ResourceCreation(message.to_string()));
        }
        value["FlowLogIds"]
            .as_array()
            .and_then(|ids| ids.first())
            .and_then(|id| id.as_str())
            .map(String::from)
            .ok_or_else(|| {
                ScanError::ResourceCreation("create-flow-logs returned no flow log id".to_string())
            })
    }

    async fn flow_log_status(&self, flow_log_id: &str) -> Result<FlowLogStatus, ScanError> {
        let value = self
            .call(&["ec2", "describe-flow-logs", "--flow-log-ids", flow_log_id])
            .await?;
        let entry = value["FlowLogs"]
            .as_array()
            .and_then(|logs| logs.first())
            .ok_or_else(|| ScanError::Aws {
                command: "ec2 describe-flow-logs".to_string(),
                message: format!("flow log {} not found", flow_log_id),
            })?;
        Ok(FlowLogStatus {
            active: entry["FlowLogStatus"].as_str() == Some("ACTIVE"),
            deliver_error: entry["DeliverLogsErrorMessage"].as_str().map(String::from),
        })
    }

    async fn delete_flow_logs(&self, flow_log_ids: &[String]) -> Result<(), ScanError> {
        let mut args = vec!["ec2", "delete-flow-logs", "--flow-log-ids"];
        args.extend(flow_log_ids.iter().map(String::as_str));
        let value = self.call(&args).await?;
        if let Some(unsuccessful) = value["Unsuccessful"].as_array()
            && !unsuccessful.is_empty()
        {
            let message = unsuccessful[0]["Error"]["Message"]
                .as_str()
                .unwrap_or("unspecified error");
            return Err(ScanError::Aws {
                command: "ec2 delete-flow-logs".to_string(),
                message: message.to_string(),
            });
        }
        Ok(())
    }

    async fn create_log_group(&self, name: &str, run_id: &str) -> Result<(), ScanError> {
        let tags = log_group_tags(run_id, &Utc::now().to_rfc3339());
        self.call(&[
            "logs",
            "create-log-group",
            "--log-group-name",
            name,
            "--tags",
            &tags,
        ])
        .await?;
        // Short retention so an orphaned group expires on its own instead of
        // accruing storage cost.
        self.call(&[
            "logs",
            "put-retention-policy",
            "--log-group-name",
            name,
            "--retention-in-days",
            "1",
        ])
        .await?;
        Ok(())
    }

    async fn delete_log_group(&self, name: &str) -> Result<(), ScanError> {
        self.call(&["logs", "delete-log-group", "--log-group-name", name])
            .await?;
        Ok(())
    }
}

impl QueryBackend for AwsCli {
    async fn start_query(
        &self,
        log_group: &str,
        query: &str,
        start: i64,
        end: i64,
    ) -> Result<String, ScanError> {
        let start_s = start.to_string();
        let end_s = end.to_string();
        let value = self
            .call(&[
                "logs",
                "start-query",
                "--log-group-name",
                log_group,
                "--start-time",
                &start_s,
                "--end-time",
                &end_s,
                "--query-string",
                query,
            ])
            .await?;
        value["queryId"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| ScanError::Query("start-query returned no query id".to_string()))
    }

    async fn query_results(&self, query_id: &str) -> Result<QueryPoll, ScanError> {
        let value = self
            .call(&["logs", "get-query-results", "--query-id", query_id])
            .await?;
        Ok(parse_query_poll(&value))
    }

    async fn raw_messages(
        &self,
        log_group: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<String>, ScanError> {
        // filter-log-events takes milliseconds.
        let start_ms = (start * 1000).to_string();
        let end_ms = (end * 1000).to_string();
        let mut messages = Vec::new();
        let mut next_token: Option<String> = None;
        for _ in 0..RAW_EVENT_PAGE_LIMIT {
            let mut args = vec![
                "logs",
                "filter-log-events",
                "--log-group-name",
                log_group,
                "--start-time",
                &start_ms,
                "--end-time",
                &end_ms,
                "--limit",
                "10000",
            ];
            if let Some(token) = &next_token {
                args.push("--next-token");
                args.push(token.as_str());
            }
            let value = self.call(&args).await?;
            if let Some(events) = value["events"].as_array() {
                messages.extend(
                    events
                        .iter()
                        .filter_map(|e| e["message"].as_str().map(String::from)),
                );
            }
            match value["nextToken"].as_str() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }
        Ok(messages)
    }
}

impl MetricsBackend for AwsCli {
    async fn nat_bytes_out(
        &self,
        gateway_id: &str,
        start_epoch: i64,
        end_epoch: i64,
    ) -> Result<f64, ScanError> {
        let start = epoch_to_iso(start_epoch);
        let end = epoch_to_iso(end_epoch);
        let dimensions = format!("Name=NatGatewayId,Value={}", gateway_id);
        let value = self
            .call(&[
                "cloudwatch",
                "get-metric-statistics",
                "--namespace",
                "AWS/NATGateway",
                "--metric-name",
                "BytesOutToDestination",
                "--dimensions",
                &dimensions,
                "--start-time",
                &start,
                "--end-time",
                &end,
                "--period",
                "3600",
                "--statistics",
                "Sum",
            ])
            .await?;
        let total = value["Datapoints"]
            .as_array()
            .map(|points| {
                points
                    .iter()
                    .filter_map(|p| p["Sum"].as_f64())
                    .sum::<f64>()
            })
            .unwrap_or(0.0);
        Ok(total)
    }
}

fn json_items<T>(value: &Value, key: &str, parse: impl Fn(&Value) -> Option<T>) -> Vec<T> {
    value[key]
        .as_array()
        .map(|items| items.iter().filter_map(&parse).collect())
        .unwrap_or_default()
}

fn log_group_tags(run_id: &str, created_at: &str) -> String {
    format!(
        "{}={},{}={}",
        RUN_TAG_KEY, run_id, CREATED_TAG_KEY, created_at
    )
}

fn flow_log_tag_spec(run_id: &str, created_at: &str) -> String {
    format!(
        "ResourceType=vpc-flow-log,Tags=[{{Key={},Value={}}},{{Key={},Value={}}}]",
        RUN_TAG_KEY, run_id, CREATED_TAG_KEY, created_at
    )
}

fn parse_query_poll(value: &Value) -> QueryPoll {
    match value["status"].as_str() {
        Some("Complete") => {
            let rows = value["results"]
                .as_array()
                .map(|rows| rows.iter().map(parse_query_row).collect())
                .unwrap_or_default();
            QueryPoll::Complete(rows)
        }
        Some("Scheduled") | Some("Running") => QueryPoll::Running,
        Some(other) => QueryPoll::Failed(format!("query ended in status {}", other)),
        None => QueryPoll::Failed("query status missing from response".to_string()),
    }
}

fn parse_query_row(row: &Value) -> QueryRow {
    row.as_array()
        .map(|fields| {
            fields
                .iter()
                .filter_map(|f| {
                    let field = f["field"].as_str()?;
                    let value = f["value"].as_str()?;
                    Some((field.to_string(), value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn epoch_to_iso(epoch: i64) -> String {
    DateTime::from_timestamp(epoch, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| epoch.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_query_poll_states() {
        assert!(matches!(
            parse_query_poll(&json!({"status": "Running"})),
            QueryPoll::Running
        ));
        assert!(matches!(
            parse_query_poll(&json!({"status": "Scheduled"})),
            QueryPoll::Running
        ));
        assert!(matches!(
            parse_query_poll(&json!({"status": "Failed"})),
            QueryPoll::Failed(_)
        ));
        assert!(matches!(
            parse_query_poll(&json!({})),
            QueryPoll::Failed(_)
        ));
    }

    #[test]
    fn test_parse_query_rows() {
        let value = json!({
            "status": "Complete",
            "results": [
                [
                    {"field": "dstAddr", "value": "52.216.10.4"},
                    {"field": "totalBytes", "value": "1048576"}
                ]
            ]
        });
        match parse_query_poll(&value) {
            QueryPoll::Complete(rows) => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0][0], ("dstAddr".to_string(), "52.216.10.4".to_string()));
            }
            other => panic!("expected complete, got {:?}", other),
        }
    }

    #[test]
    fn test_credential_errors_are_preconditions() {
        let err = classify_cli_error("ec2 describe-nat-gateways", "Unable to locate credentials");
        assert!(err.is_precondition());
        let err = classify_cli_error("ec2 create-flow-logs", "An error occurred (UnauthorizedOperation)");
        assert!(err.is_precondition());
        let err = classify_cli_error("ec2 describe-nat-gateways", "connection reset");
        assert!(!err.is_precondition());
    }

    #[test]
    fn test_flow_log_tag_spec_shape() {
        let spec = flow_log_tag_spec("run-1", "2026-08-30T00:00:00+00:00");
        assert!(spec.starts_with("ResourceType=vpc-flow-log,Tags=["));
        assert!(spec.contains("Key=natscout:run,Value=run-1"));
        assert!(spec.contains("Key=natscout:created"));
    }

    #[test]
    fn test_log_group_tags_carry_run_and_timestamp() {
        let tags = log_group_tags("run-1", "2026-08-30T00:00:00+00:00");
        assert!(tags.contains("natscout:run=run-1"));
        assert!(tags.contains("natscout:created=2026-08-30T00:00:00+00:00"));
    }

    #[test]
    fn test_epoch_to_iso() {
        assert_eq!(epoch_to_iso(0), "1970-01-01T00:00:00+00:00");
    }
}
