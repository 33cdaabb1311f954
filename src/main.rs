mod analysis;
mod aws;
mod collect;
mod cost;
mod error;
mod flowlog;
mod metrics;
mod orchestrator;
mod ranges;
mod remediation;
mod report;
mod stop;
#[cfg(test)]
mod test_utils;
mod topology;

use std::io::Write as _;
use std::path::PathBuf;

use clap::Parser;
use tokio::sync::mpsc;

use crate::aws::AwsCli;
use crate::error::ScanError;
use crate::orchestrator::{
    Orchestrator, Prompter, RetentionChoice, ScanConfig, ScanEvent, SpendPreview,
};
use crate::ranges::RangeClassifier;
use crate::report::ScanReport;
use crate::stop::{StopSignal, stop_channel};

/// Measures NAT gateway traffic with a temporary flow log and estimates how
/// much of it could ride free or cheaper VPC endpoints instead.
#[derive(Parser)]
#[command(name = "natscout", version, about)]
struct Args {
    /// AWS region to scan (falls back to AWS_REGION)
    #[arg(long)]
    region: Option<String>,

    /// NAT gateway to instrument; required when the region has more than one
    #[arg(long)]
    gateway: Option<String>,

    /// Collection window in minutes
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(5..=60))]
    minutes: u64,

    /// IAM role ARN the flow log uses to deliver into CloudWatch Logs
    #[arg(long)]
    role_arn: Option<String>,

    /// Skip the approval prompt (the scan still creates billable resources)
    #[arg(long, short = 'y')]
    yes: bool,

    /// Keep the log group after the run without asking
    #[arg(long, conflicts_with = "delete_logs")]
    keep_logs: bool,

    /// Delete the log group after the run without asking
    #[arg(long)]
    delete_logs: bool,

    /// Print the report as JSON instead of text
    #[arg(long)]
    json: bool,

    /// AWS CLI profile to use
    #[arg(long)]
    profile: Option<String>,

    /// Where to cache the published address-range document
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let code = run(Args::parse()).await;
    std::process::exit(code);
}

async fn run(args: Args) -> i32 {
    let (handle, stop) = stop_channel();
    {
        let handle = handle.clone();
        ctrlc::set_handler(move || {
            eprintln!("\ninterrupt received, cleaning up...");
            handle.stop();
        })
        .expect("failed to install interrupt handler");
    }

    let region = args
        .region
        .clone()
        .or_else(|| std::env::var("AWS_REGION").ok())
        .unwrap_or_default();
    let cache_dir = args.cache_dir.clone().unwrap_or_else(default_cache_dir);

    println!("loading published address ranges...");
    let classifier = {
        let region = region.clone();
        match tokio::task::spawn_blocking(move || RangeClassifier::load(&cache_dir, &region)).await
        {
            Ok(Ok(classifier)) => classifier,
            Ok(Err(e)) => {
                eprintln!("error: {}", e);
                return 1;
            }
            Err(e) => {
                eprintln!("error: range load task failed: {}", e);
                return 1;
            }
        }
    };
    println!("  {} prefixes loaded", classifier.prefix_count());

    let client = AwsCli::new(region.clone(), args.profile.clone());
    let prompter = StdinPrompter { stop: stop.clone() };
    let (events_tx, mut events_rx) = mpsc::channel(256);
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            print_event(&event);
        }
    });

    let config = ScanConfig {
        region,
        duration_minutes: args.minutes,
        gateway_id: args.gateway.clone(),
        role_arn: args.role_arn.clone().unwrap_or_default(),
        assume_yes: args.yes,
        retention_override: if args.keep_logs {
            Some(RetentionChoice::Keep)
        } else if args.delete_logs {
            Some(RetentionChoice::Delete)
        } else {
            None
        },
    };

    let orchestrator = Orchestrator::new(&client, &prompter, classifier, config, stop, events_tx);
    let result = orchestrator.run().await;
    let _ = printer.await;

    match result {
        Ok(report) => {
            if args.json {
                match serde_json::to_string_pretty(&report) {
                    Ok(body) => println!("{}", body),
                    Err(e) => {
                        eprintln!("error: failed to serialize report: {}", e);
                        return 1;
                    }
                }
            } else {
                print_report(&report);
            }
            if report.cleanup_failures.is_empty() { 0 } else { 1 }
        }
        Err(failure) => {
            match &failure.error {
                ScanError::Precondition { message, hint } => {
                    eprintln!("error: {}", message);
                    eprintln!("hint: {}", hint);
                }
                _ => eprintln!("error: {}", failure),
            }
            for problem in &failure.cleanup_failures {
                eprintln!("cleanup: {}", problem);
            }
            match failure.error {
                ScanError::Precondition { .. } => 2,
                ScanError::Cancelled => 130,
                _ => 1,
            }
        }
    }
}

fn default_cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("NATSCOUT_CACHE_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".cache").join("natscout");
    }
    std::env::temp_dir().join("natscout")
}

fn print_event(event: &ScanEvent) {
    match event {
        ScanEvent::Phase(phase) => println!("[{}]", phase),
        ScanEvent::Progress {
            elapsed, remaining, ..
        } => println!(
            "  collecting: {}s elapsed, {}s remaining",
            elapsed.as_secs(),
            remaining.as_secs()
        ),
        ScanEvent::Info(message) => println!("  {}", message),
        ScanEvent::Warning(message) => eprintln!("  warning: {}", message),
    }
}

fn print_report(report: &ScanReport) {
    let stats = &report.statistics;
    println!();
    println!(
        "=== NAT gateway {} ({} minute sample, run {}) ===",
        report.gateway_id, report.window_minutes, report.run_id
    );
    println!(
        "observed: {} flow records, {:.2} MiB{}",
        stats.total_records,
        mib(stats.total_bytes),
        if stats.from_fallback {
            " (from raw-record fallback)"
        } else {
            ""
        }
    );
    for (service, bytes) in &stats.by_service {
        println!("  {:<20} {:>12.2} MiB", service.as_str(), mib(*bytes));
    }
    if !stats.top_sources.is_empty() {
        println!("top talkers:");
        for source in &stats.top_sources {
            println!("  {:<20} {:>12.2} MiB", source.address, mib(source.bytes));
        }
    }

    let estimate = &report.estimate;
    println!();
    println!(
        "projected month (linear extrapolation, estimate only): {:.1} GB through the gateway",
        estimate.monthly_gb
    );
    println!(
        "implied current cost: ${:.2}/month at ${:.3}/GB{}",
        estimate.current_monthly_cost,
        estimate.rate_per_gb,
        if estimate.rate_known {
            ""
        } else {
            " (unknown region, default rate)"
        }
    );
    for saving in &estimate.savings {
        println!(
            "  move {} to a VPC endpoint: save ~${:.2}/month ({:.1} GB)",
            saving.service.as_str(),
            saving.monthly_savings,
            saving.monthly_gb
        );
    }
    println!(
        "total potential savings: ${:.2}/month",
        estimate.total_monthly_savings
    );

    let analysis = &report.endpoint_analysis;
    if !analysis.findings.is_empty() {
        println!();
        println!("recommended fixes for {}:", analysis.vpc_id);
        for finding in &analysis.findings {
            match finding {
                crate::remediation::Finding::MissingEndpoint {
                    service,
                    remediation,
                    ..
                } => {
                    println!("  missing {} gateway endpoint:", service.as_str());
                    println!("    {}", remediation);
                }
                crate::remediation::Finding::MissingAssociation {
                    service,
                    route_table_id,
                    remediation,
                    ..
                } => {
                    println!(
                        "  {} endpoint exists but {} is not associated:",
                        service.as_str(),
                        route_table_id
                    );
                    println!("    {}", remediation);
                }
            }
        }
    }
    if !analysis.interface_costs.is_empty() {
        println!();
        println!("existing interface endpoints (recurring cost):");
        for cost in &analysis.interface_costs {
            println!(
                "  {} ({}): ~${:.2}/month across {} zone(s){}",
                cost.endpoint_id,
                cost.service_name,
                cost.monthly_hourly_cost,
                cost.zone_count,
                if cost.assumed_single_zone {
                    " [zone count unknown, assumed 1]"
                } else {
                    ""
                }
            );
        }
    }

    if let Some(group) = &report.log_group
        && report.log_group_kept
    {
        println!();
        println!("log group kept for inspection: {}", group);
    }
    for problem in &report.cleanup_failures {
        eprintln!("cleanup: {}", problem);
    }
}

fn mib(bytes: u64) -> f64 {
    bytes as f64 / 1_048_576.0
}

struct StdinPrompter {
    stop: StopSignal,
}

impl StdinPrompter {
    async fn ask(&self, prompt: &str) -> Option<String> {
        print!("{}", prompt);
        let _ = std::io::stdout().flush();
        let line = tokio::task::spawn_blocking(|| {
            let mut buffer = String::new();
            std::io::stdin().read_line(&mut buffer).ok();
            buffer
        });
        tokio::select! {
            result = line => result.ok().map(|l| l.trim().to_lowercase()),
            _ = self.stop.cancelled() => None,
        }
    }
}

impl Prompter for StdinPrompter {
    async fn approve_spend(&self, preview: &SpendPreview) -> bool {
        println!();
        println!(
            "about to create a flow log on {} for {} minutes",
            preview.gateway_id, preview.duration_minutes
        );
        println!(
            "expected log volume: ~{:.2} GB{}",
            preview.expected_sample_gb,
            if preview.estimate_from_metrics {
                " (from gateway metrics)"
            } else {
                " (static assumption)"
            }
        );
        println!("flow-log ingestion and storage for this window are billable.");
        matches!(
            self.ask("proceed? [y/N] ").await.as_deref(),
            Some("y") | Some("yes")
        )
    }

    async fn retention(&self, log_group: &str) -> RetentionChoice {
        println!();
        println!("the log group {} holds the raw flow records.", log_group);
        match self
            .ask("keep it for inspection? it expires in 1 day either way [Y/n] ")
            .await
            .as_deref()
        {
            Some("n") | Some("no") => RetentionChoice::Delete,
            _ => RetentionChoice::Keep,
        }
    }
}
