//! Traffic analysis. Primary path runs a server-side aggregation query over
//! the delivered flow records and classifies the per-destination totals. A
//! zero-row result is ambiguous (no traffic, schema mismatch, or delivery
//! lag), so it triggers a client-side re-aggregation over raw records before
//! "no traffic observed" is reported. Bytes are never dropped: anything
//! unclassifiable, including records with no destination at all, lands in
//! `other`.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::ScanError;
use crate::orchestrator::ScanEvent;
use crate::ranges::{RangeClassifier, ServiceTag};
use crate::stop::StopSignal;

pub const QUERY_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(180);
const TOP_SOURCES: usize = 10;

/// Destination field name candidates, in priority order. Insights reports
/// `dstAddr` for the default format but older schemas differ.
const DEST_FIELDS: [&str; 3] = ["dstAddr", "dstaddr", "dst_addr"];
const SOURCE_FIELDS: [&str; 3] = ["srcAddr", "srcaddr", "src_addr"];
const BYTES_FIELDS: [&str; 3] = ["totalBytes", "bytes", "sum(bytes)"];
const COUNT_FIELDS: [&str; 2] = ["recordCount", "count(*)"];

const AGGREGATION_QUERY: &str = "stats sum(bytes) as totalBytes, count(*) as recordCount \
     by dstAddr | sort totalBytes desc | limit 10000";
const TOP_SOURCES_QUERY: &str = "stats sum(bytes) as totalBytes by srcAddr \
     | sort totalBytes desc | limit 10";

/// One result row: field name/value pairs as the query API returns them.
pub type QueryRow = Vec<(String, String)>;

#[derive(Debug)]
pub enum QueryPoll {
    Running,
    Complete(Vec<QueryRow>),
    Failed(String),
}

/// Log query surface: submit, poll, and the raw-record escape hatch.
pub trait QueryBackend {
    async fn start_query(
        &self,
        log_group: &str,
        query: &str,
        start: i64,
        end: i64,
    ) -> Result<String, ScanError>;
    async fn query_results(&self, query_id: &str) -> Result<QueryPoll, ScanError>;
    /// Raw record messages for the window, for client-side re-aggregation.
    async fn raw_messages(
        &self,
        log_group: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<String>, ScanError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceTraffic {
    pub address: String,
    pub bytes: u64,
}

/// Per-run aggregate. Built once, immutable afterwards. Invariant: the
/// per-service bytes partition the total exactly.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficStatistics {
    pub total_bytes: u64,
    pub total_records: u64,
    pub by_service: BTreeMap<ServiceTag, u64>,
    pub top_sources: Vec<SourceTraffic>,
    /// True when the raw-record fallback produced these numbers.
    pub from_fallback: bool,
}

impl TrafficStatistics {
    fn empty() -> Self {
        let mut by_service = BTreeMap::new();
        for tag in ServiceTag::ALL {
            by_service.insert(tag, 0);
        }
        TrafficStatistics {
            total_bytes: 0,
            total_records: 0,
            by_service,
            top_sources: Vec::new(),
            from_fallback: false,
        }
    }

    fn add(&mut self, tag: ServiceTag, bytes: u64, records: u64) {
        self.total_bytes += bytes;
        self.total_records += records;
        *self.by_service.entry(tag).or_insert(0) += bytes;
    }

    pub fn service_bytes(&self, tag: ServiceTag) -> u64 {
        self.by_service.get(&tag).copied().unwrap_or(0)
    }
}

/// One parsed flow record from the raw fallback path. Positional v2 format:
/// version account-id interface-id srcaddr dstaddr srcport dstport protocol
/// packets bytes start end action log-status.
///
/// Known risk: this assumes the fixed positional schema. A provider format
/// change would silently misparse both this path and the field names the
/// aggregation query relies on.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub src_addr: Option<String>,
    pub dst_addr: Option<String>,
    pub bytes: u64,
    pub action: Option<String>,
}

impl FlowRecord {
    pub fn parse(message: &str) -> Option<Self> {
        let fields: Vec<&str> = message.split_whitespace().collect();
        if fields.len() < 14 {
            return None;
        }
        Some(FlowRecord {
            src_addr: field_or_none(fields[3]),
            dst_addr: field_or_none(fields[4]),
            bytes: parse_byte_count(fields[9]).unwrap_or(0),
            action: field_or_none(fields[12]),
        })
    }
}

fn field_or_none(field: &str) -> Option<String> {
    if field == "-" || field.is_empty() {
        None
    } else {
        Some(field.to_string())
    }
}

/// Byte counts appear as integer or floating text depending on the path.
fn parse_byte_count(text: &str) -> Option<u64> {
    if let Ok(n) = text.parse::<u64>() {
        return Some(n);
    }
    text.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite() && *f >= 0.0)
        .map(|f| f.round() as u64)
}

fn row_field<'a>(row: &'a QueryRow, candidates: &[&str]) -> Option<&'a str> {
    for name in candidates {
        if let Some((_, value)) = row.iter().find(|(field, _)| field == name) {
            return Some(value.as_str());
        }
    }
    None
}

/// Analyze the collection window. Primary aggregation first; an empty result
/// set falls back to raw records before reporting zero.
pub async fn analyze<B: QueryBackend>(
    backend: &B,
    classifier: &RangeClassifier,
    log_group: &str,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    stop: &StopSignal,
    events: &mpsc::Sender<ScanEvent>,
) -> Result<TrafficStatistics, ScanError> {
    let start = window_start.timestamp();
    let end = window_end.timestamp();

    let rows = run_query(backend, log_group, AGGREGATION_QUERY, start, end, stop).await?;
    if !rows.is_empty() {
        let mut stats = fold_aggregated(classifier, &rows);
        // Top talkers are informational only; a failure here degrades.
        match run_query(backend, log_group, TOP_SOURCES_QUERY, start, end, stop).await {
            Ok(source_rows) => stats.top_sources = fold_top_sources(&source_rows),
            Err(ScanError::Cancelled) => return Err(ScanError::Cancelled),
            Err(e) => {
                let _ = events
                    .send(ScanEvent::Warning(format!(
                        "top-source query failed, omitting top talkers: {}",
                        e
                    )))
                    .await;
            }
        }
        return Ok(stats);
    }

    // Ambiguous zero: re-aggregate client-side before concluding anything.
    let _ = events
        .send(ScanEvent::Info(
            "aggregation returned no rows; re-checking raw records".to_string(),
        ))
        .await;
    let messages = backend.raw_messages(log_group, start, end).await?;
    let mut stats = fold_raw(classifier, &messages);
    stats.from_fallback = true;
    Ok(stats)
}

async fn run_query<B: QueryBackend>(
    backend: &B,
    log_group: &str,
    query: &str,
    start: i64,
    end: i64,
    stop: &StopSignal,
) -> Result<Vec<QueryRow>, ScanError> {
    let query_id = backend.start_query(log_group, query, start, end).await?;
    let deadline = tokio::time::Instant::now() + QUERY_TIMEOUT;
    loop {
        if stop.is_stopped() {
            return Err(ScanError::Cancelled);
        }
        match backend.query_results(&query_id).await? {
            QueryPoll::Complete(rows) => return Ok(rows),
            QueryPoll::Failed(reason) => return Err(ScanError::Query(reason)),
            QueryPoll::Running => {}
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ScanError::Query(format!(
                "query {} still running after {}s",
                query_id,
                QUERY_TIMEOUT.as_secs()
            )));
        }
        if !stop.sleep(QUERY_POLL_INTERVAL).await {
            return Err(ScanError::Cancelled);
        }
    }
}

fn fold_aggregated(classifier: &RangeClassifier, rows: &[QueryRow]) -> TrafficStatistics {
    let mut stats = TrafficStatistics::empty();
    for row in rows {
        let bytes = row_field(row, &BYTES_FIELDS)
            .and_then(parse_byte_count)
            .unwrap_or(0);
        let records = row_field(row, &COUNT_FIELDS)
            .and_then(parse_byte_count)
            .unwrap_or(1);
        // A row without a destination still carries bytes; dropping it would
        // understate volume.
        let tag = match row_field(row, &DEST_FIELDS) {
            Some(dst) => classifier.classify_str(dst),
            None => ServiceTag::Other,
        };
        stats.add(tag, bytes, records);
    }
    stats
}

fn fold_top_sources(rows: &[QueryRow]) -> Vec<SourceTraffic> {
    rows.iter()
        .filter_map(|row| {
            let address = row_field(row, &SOURCE_FIELDS)?.to_string();
            let bytes = row_field(row, &BYTES_FIELDS).and_then(parse_byte_count)?;
            Some(SourceTraffic { address, bytes })
        })
        .take(TOP_SOURCES)
        .collect()
}

fn fold_raw(classifier: &RangeClassifier, messages: &[String]) -> TrafficStatistics {
    let mut stats = TrafficStatistics::empty();
    let mut per_source: HashMap<String, u64> = HashMap::new();
    for message in messages {
        let Some(record) = FlowRecord::parse(message) else {
            continue;
        };
        let tag = match &record.dst_addr {
            Some(dst) => classifier.classify_str(dst),
            None => ServiceTag::Other,
        };
        stats.add(tag, record.bytes, 1);
        if let Some(src) = &record.src_addr {
            *per_source.entry(src.clone()).or_insert(0) += record.bytes;
        }
    }
    let mut sources: Vec<SourceTraffic> = per_source
        .into_iter()
        .map(|(address, bytes)| SourceTraffic { address, bytes })
        .collect();
    sources.sort_by(|a, b| b.bytes.cmp(&a.bytes).then(a.address.cmp(&b.address)));
    sources.truncate(TOP_SOURCES);
    stats.top_sources = sources;
    stats
}
