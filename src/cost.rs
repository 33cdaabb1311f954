//! Cost projection. Linear extrapolation of the sample window to a fixed
//! 30-day month against the regional NAT data-processing rate. No variance or
//! confidence modelling; callers must present the result as an estimate.

use std::collections::HashMap;

use lazy_static::lazy_static;
use serde::Serialize;

use crate::analysis::TrafficStatistics;
use crate::ranges::ServiceTag;

pub const MINUTES_PER_MONTH: f64 = 43_200.0;
pub const DEFAULT_NAT_GB_RATE: f64 = 0.045;
const BYTES_PER_GB: f64 = 1_073_741_824.0;

lazy_static! {
    /// NAT gateway data-processing rate in USD per GB.
    static ref NAT_GB_RATES: HashMap<&'static str, f64> = {
        let mut rates = HashMap::new();
        rates.insert("us-east-1", 0.045);
        rates.insert("us-east-2", 0.045);
        rates.insert("us-west-1", 0.045);
        rates.insert("us-west-2", 0.045);
        rates.insert("ca-central-1", 0.045);
        rates.insert("eu-west-1", 0.045);
        rates.insert("eu-west-2", 0.045);
        rates.insert("eu-west-3", 0.05);
        rates.insert("eu-central-1", 0.052);
        rates.insert("eu-north-1", 0.044);
        rates.insert("ap-southeast-1", 0.059);
        rates.insert("ap-southeast-2", 0.059);
        rates.insert("ap-northeast-1", 0.062);
        rates.insert("ap-northeast-2", 0.059);
        rates.insert("ap-south-1", 0.056);
        rates.insert("sa-east-1", 0.093);
        rates
    };
}

/// Rate lookup with an explicit default: an unknown region degrades the
/// estimate, it never fails the run.
pub fn regional_rate(region: &str) -> (f64, bool) {
    match NAT_GB_RATES.get(region) {
        Some(rate) => (*rate, true),
        None => (DEFAULT_NAT_GB_RATE, false),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceSaving {
    pub service: ServiceTag,
    pub monthly_gb: f64,
    /// Assumes full replacement by the free or cheaper endpoint.
    pub monthly_savings: f64,
}

/// Per-region projection derived from one sample window.
#[derive(Debug, Clone, Serialize)]
pub struct CostEstimate {
    pub region: String,
    pub rate_per_gb: f64,
    pub rate_known: bool,
    pub sample_minutes: u64,
    pub sample_gb: f64,
    pub monthly_gb: f64,
    pub current_monthly_cost: f64,
    pub savings: Vec<ServiceSaving>,
    pub total_monthly_savings: f64,
}

/// `monthly_gb = sample_gb × (43200 / sample_minutes)`, then rate math. The
/// savings can never exceed the implied current cost because the classified
/// bytes partition the total.
pub fn project(stats: &TrafficStatistics, sample_minutes: u64, region: &str) -> CostEstimate {
    let (rate_per_gb, rate_known) = regional_rate(region);
    let minutes = sample_minutes.max(1) as f64;
    let scale = MINUTES_PER_MONTH / minutes;

    let sample_gb = stats.total_bytes as f64 / BYTES_PER_GB;
    let monthly_gb = sample_gb * scale;
    let current_monthly_cost = monthly_gb * rate_per_gb;

    let mut savings = Vec::new();
    let mut total_monthly_savings = 0.0;
    for service in ServiceTag::CLASSIFIED {
        let bytes = stats.service_bytes(service);
        if bytes == 0 {
            continue;
        }
        let service_monthly_gb = (bytes as f64 / BYTES_PER_GB) * scale;
        let monthly_savings = service_monthly_gb * rate_per_gb;
        total_monthly_savings += monthly_savings;
        savings.push(ServiceSaving {
            service,
            monthly_gb: service_monthly_gb,
            monthly_savings,
        });
    }

    CostEstimate {
        region: region.to_string(),
        rate_per_gb,
        rate_known,
        sample_minutes,
        sample_gb,
        monthly_gb,
        current_monthly_cost,
        savings,
        total_monthly_savings,
    }
}
