//! Address-range classification. Loads the provider-published CIDR-to-service
//! document (cached on disk with an age-based TTL) plus resolved
//! container-registry endpoint addresses, and maps destination addresses to
//! the service they belong to. Classification is total: anything unmatched or
//! unparsable is `Other`, never an error.

use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::error::ScanError;

const RANGE_DOCUMENT_URL: &str = "https://ip-ranges.amazonaws.com/ip-ranges.json";
const CACHE_FILE: &str = "ip-ranges.json";
const CACHE_STAMP_FILE: &str = "ip-ranges.fetched";
const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Service a destination address belongs to. Variant order is the
/// classification priority: registry addresses live inside the generic EC2
/// ranges, so they are tested before the published storage sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceTag {
    ContainerRegistry,
    S3,
    DynamoDb,
    Other,
}

impl ServiceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceTag::ContainerRegistry => "container-registry",
            ServiceTag::S3 => "s3",
            ServiceTag::DynamoDb => "dynamodb",
            ServiceTag::Other => "other",
        }
    }

    /// Services that can be fronted by a VPC endpoint, in priority order.
    pub const CLASSIFIED: [ServiceTag; 3] = [
        ServiceTag::ContainerRegistry,
        ServiceTag::S3,
        ServiceTag::DynamoDb,
    ];

    /// All tags, for building exhaustive per-service aggregates.
    pub const ALL: [ServiceTag; 4] = [
        ServiceTag::ContainerRegistry,
        ServiceTag::S3,
        ServiceTag::DynamoDb,
        ServiceTag::Other,
    ];
}

impl std::fmt::Display for ServiceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct RangeDocument {
    #[serde(default)]
    prefixes: Vec<V4Prefix>,
    #[serde(default)]
    ipv6_prefixes: Vec<V6Prefix>,
}

#[derive(Debug, Deserialize)]
struct V4Prefix {
    ip_prefix: String,
    service: String,
}

#[derive(Debug, Deserialize)]
struct V6Prefix {
    ipv6_prefix: String,
    service: String,
}

/// Prefix sets keyed by service, in classification priority order.
pub struct RangeClassifier {
    sets: Vec<(ServiceTag, Vec<IpNetwork>)>,
}

impl RangeClassifier {
    /// Load from the local cache, refetching when the sidecar timestamp is
    /// older than 24h or missing. Registry endpoint hostnames are resolved
    /// best-effort; a resolution failure only degrades registry
    /// classification to `other`.
    pub fn load(cache_dir: &Path, region: &str) -> Result<Self, ScanError> {
        let body = load_document(cache_dir)?;
        let doc: RangeDocument = serde_json::from_str(&body)
            .map_err(|e| ScanError::RangeDocument(format!("parse error: {}", e)))?;
        let registry_hosts = resolve_registry_hosts(region);
        Ok(Self::from_parts(&doc, registry_hosts))
    }

    fn from_parts(doc: &RangeDocument, registry_hosts: Vec<IpAddr>) -> Self {
        let mut s3 = Vec::new();
        let mut dynamodb = Vec::new();
        for prefix in &doc.prefixes {
            let Ok(net) = prefix.ip_prefix.parse::<IpNetwork>() else {
                continue;
            };
            match prefix.service.as_str() {
                "S3" => s3.push(net),
                "DYNAMODB" => dynamodb.push(net),
                _ => {}
            }
        }
        for prefix in &doc.ipv6_prefixes {
            let Ok(net) = prefix.ipv6_prefix.parse::<IpNetwork>() else {
                continue;
            };
            match prefix.service.as_str() {
                "S3" => s3.push(net),
                "DYNAMODB" => dynamodb.push(net),
                _ => {}
            }
        }
        let registry = registry_hosts
            .into_iter()
            .map(host_network)
            .collect::<Vec<_>>();
        RangeClassifier {
            sets: vec![
                (ServiceTag::ContainerRegistry, registry),
                (ServiceTag::S3, s3),
                (ServiceTag::DynamoDb, dynamodb),
            ],
        }
    }

    /// Build directly from prefix lists. Used by tests and callers that
    /// already hold a parsed document.
    pub fn from_sets(
        registry: Vec<IpNetwork>,
        s3: Vec<IpNetwork>,
        dynamodb: Vec<IpNetwork>,
    ) -> Self {
        RangeClassifier {
            sets: vec![
                (ServiceTag::ContainerRegistry, registry),
                (ServiceTag::S3, s3),
                (ServiceTag::DynamoDb, dynamodb),
            ],
        }
    }

    /// Total and deterministic: first containing set in priority order wins,
    /// everything else is `Other`.
    pub fn classify(&self, addr: IpAddr) -> ServiceTag {
        for (tag, networks) in &self.sets {
            if networks.iter().any(|net| net.contains(addr)) {
                return *tag;
            }
        }
        ServiceTag::Other
    }

    /// String-input variant; unparsable input is `Other`.
    pub fn classify_str(&self, addr: &str) -> ServiceTag {
        match addr.parse::<IpAddr>() {
            Ok(ip) => self.classify(ip),
            Err(_) => ServiceTag::Other,
        }
    }

    pub fn prefix_count(&self) -> usize {
        self.sets.iter().map(|(_, nets)| nets.len()).sum()
    }
}

fn host_network(addr: IpAddr) -> IpNetwork {
    match addr {
        IpAddr::V4(v4) => IpNetwork::new(IpAddr::V4(v4), 32).unwrap_or_else(|_| unreachable!()),
        IpAddr::V6(v6) => IpNetwork::new(IpAddr::V6(v6), 128).unwrap_or_else(|_| unreachable!()),
    }
}

/// Resolve the regional registry API and docker endpoints. The published
/// range document carries no registry entry, so these host addresses are the
/// only way to tell registry traffic apart from generic compute.
fn resolve_registry_hosts(region: &str) -> Vec<IpAddr> {
    let hosts = [
        format!("api.ecr.{}.amazonaws.com", region),
        format!("dkr.ecr.{}.amazonaws.com", region),
    ];
    let mut addrs = Vec::new();
    for host in &hosts {
        if let Ok(resolved) = dns_lookup::lookup_host(host) {
            addrs.extend(resolved);
        }
    }
    addrs
}

fn load_document(cache_dir: &Path) -> Result<String, ScanError> {
    let cache_file = cache_dir.join(CACHE_FILE);
    let stamp_file = cache_dir.join(CACHE_STAMP_FILE);

    if cache_is_fresh(&stamp_file)
        && let Ok(body) = fs::read_to_string(&cache_file)
        && !body.is_empty()
    {
        return Ok(body);
    }

    let body = fetch_document()?;

    // Cache write failures are non-fatal; the next run just refetches.
    if fs::create_dir_all(cache_dir).is_ok() {
        let _ = fs::write(&cache_file, &body);
        let _ = fs::write(&stamp_file, Utc::now().to_rfc3339());
    }
    Ok(body)
}

fn cache_is_fresh(stamp_file: &Path) -> bool {
    let Ok(stamp) = fs::read_to_string(stamp_file) else {
        return false;
    };
    let Ok(fetched) = DateTime::parse_from_rfc3339(stamp.trim()) else {
        return false;
    };
    let age = Utc::now().signed_duration_since(fetched.with_timezone(&Utc));
    age.to_std().map(|a| a < CACHE_TTL).unwrap_or(false)
}

fn fetch_document() -> Result<String, ScanError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .map_err(|e| ScanError::RangeDocument(e.to_string()))?;
    let response = client
        .get(RANGE_DOCUMENT_URL)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| ScanError::RangeDocument(e.to_string()))?;
    response
        .text()
        .map_err(|e| ScanError::RangeDocument(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> RangeClassifier {
        RangeClassifier::from_sets(
            vec!["52.119.100.10/32".parse().unwrap()],
            vec!["52.216.0.0/15".parse().unwrap(), "3.5.0.0/19".parse().unwrap()],
            vec!["52.94.0.0/22".parse().unwrap()],
        )
    }

    #[test]
    fn test_classify_priority_order() {
        let c = classifier();
        assert_eq!(c.classify_str("52.216.10.4"), ServiceTag::S3);
        assert_eq!(c.classify_str("52.94.1.1"), ServiceTag::DynamoDb);
        assert_eq!(c.classify_str("52.119.100.10"), ServiceTag::ContainerRegistry);
        assert_eq!(c.classify_str("8.8.8.8"), ServiceTag::Other);
    }

    #[test]
    fn test_classify_is_total() {
        let c = classifier();
        // Garbage never errors, it degrades to Other.
        assert_eq!(c.classify_str("not-an-address"), ServiceTag::Other);
        assert_eq!(c.classify_str(""), ServiceTag::Other);
        assert_eq!(c.classify_str("::1"), ServiceTag::Other);
    }

    #[test]
    fn test_classify_deterministic() {
        let c = classifier();
        for _ in 0..3 {
            assert_eq!(c.classify_str("52.216.10.4"), ServiceTag::S3);
        }
    }

    #[test]
    fn test_from_parts_skips_unknown_services() {
        let doc = RangeDocument {
            prefixes: vec![
                V4Prefix {
                    ip_prefix: "52.216.0.0/15".to_string(),
                    service: "S3".to_string(),
                },
                V4Prefix {
                    ip_prefix: "3.0.0.0/8".to_string(),
                    service: "EC2".to_string(),
                },
                V4Prefix {
                    ip_prefix: "bogus".to_string(),
                    service: "S3".to_string(),
                },
            ],
            ipv6_prefixes: vec![V6Prefix {
                ipv6_prefix: "2600:1fa0::/32".to_string(),
                service: "DYNAMODB".to_string(),
            }],
        };
        let c = RangeClassifier::from_parts(&doc, vec![]);
        assert_eq!(c.prefix_count(), 2);
        assert_eq!(c.classify_str("52.216.10.4"), ServiceTag::S3);
        assert_eq!(c.classify_str("3.1.2.3"), ServiceTag::Other);
        assert_eq!(c.classify_str("2600:1fa0::1"), ServiceTag::DynamoDb);
    }

    #[test]
    fn test_cache_freshness() {
        let dir = tempfile::tempdir().unwrap();
        let stamp = dir.path().join(CACHE_STAMP_FILE);

        // Missing stamp: stale.
        assert!(!cache_is_fresh(&stamp));

        // Fresh stamp.
        fs::write(&stamp, Utc::now().to_rfc3339()).unwrap();
        assert!(cache_is_fresh(&stamp));

        // Stamp older than the TTL.
        let old = Utc::now() - chrono::Duration::hours(25);
        fs::write(&stamp, old.to_rfc3339()).unwrap();
        assert!(!cache_is_fresh(&stamp));

        // Corrupt stamp: stale, not a panic.
        fs::write(&stamp, "yesterday-ish").unwrap();
        assert!(!cache_is_fresh(&stamp));
    }
}
