//! Prometheus metrics collection
//!
//! The services keep their own atomic counters; this module mirrors them into
//! Prometheus gauges each time `/metrics` is scraped.

use once_cell::sync::Lazy;
use prometheus::{register_int_gauge_vec, Encoder, IntGaugeVec, TextEncoder};
use provenance_service::{PipelineStats, ResyncStats, Services, SupervisorStats};

/// Resync totals by kind
pub static RESYNC_TOTALS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "provenance_resync_total",
        "Resync rounds and their outcomes since start",
        &["kind"]
    )
    .expect("Failed to create resync totals gauge")
});

/// Extraction outcomes
pub static EXTRACTION_OUTCOMES: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "provenance_extraction_outcomes_total",
        "Commit extraction outcomes since start",
        &["outcome"]
    )
    .expect("Failed to create extraction outcomes gauge")
});

/// Resolution outcomes
pub static RESOLUTION_OUTCOMES: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "provenance_resolution_outcomes_total",
        "Commit resolution outcomes since start",
        &["outcome"]
    )
    .expect("Failed to create resolution outcomes gauge")
});

/// Pipeline stage activity
pub static PIPELINE_TOTALS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "provenance_pipeline_total",
        "Pipeline stage activity since start",
        &["stage"]
    )
    .expect("Failed to create pipeline totals gauge")
});

/// Worker supervision events per pool
pub static WORKER_SUPERVISION: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "provenance_worker_supervision_total",
        "Messages handled and crash recoveries per worker pool",
        &["pool", "event"]
    )
    .expect("Failed to create worker supervision gauge")
});

/// Build information gauge (version)
pub static BUILD_INFO: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "provenance_build_info",
        "Build information",
        &["version", "store_version"]
    )
    .expect("Failed to create build info gauge")
});

/// Initialize metrics
pub fn init_metrics() {
    Lazy::force(&RESYNC_TOTALS);
    Lazy::force(&EXTRACTION_OUTCOMES);
    Lazy::force(&RESOLUTION_OUTCOMES);
    Lazy::force(&PIPELINE_TOTALS);
    Lazy::force(&WORKER_SUPERVISION);

    BUILD_INFO
        .with_label_values(&[env!("CARGO_PKG_VERSION"), provenance_store::VERSION])
        .set(1);

    tracing::info!("Metrics initialized successfully");
}

fn set(gauge: &IntGaugeVec, labels: &[&str], value: u64) {
    gauge
        .with_label_values(labels)
        .set(i64::try_from(value).unwrap_or(i64::MAX));
}

pub fn record_resync(stats: &ResyncStats) {
    let totals = [
        ("rounds", &stats.rounds),
        ("failed_rounds", &stats.failed_rounds),
        ("artifacts", &stats.artifacts),
        ("changed", &stats.changed),
        ("versions_registered", &stats.versions_registered),
        ("failures", &stats.failures),
    ];
    for (kind, counter) in totals {
        set(&RESYNC_TOTALS, &[kind], ResyncStats::get(counter));
    }
}

pub fn record_pipeline(stats: &PipelineStats) {
    set(&EXTRACTION_OUTCOMES, &["discovered"], PipelineStats::get(&stats.commits_discovered));
    set(&EXTRACTION_OUTCOMES, &["not_found"], PipelineStats::get(&stats.commits_absent));
    set(&EXTRACTION_OUTCOMES, &["failed"], PipelineStats::get(&stats.extraction_failures));

    set(&RESOLUTION_OUTCOMES, &["resolved"], PipelineStats::get(&stats.commits_resolved));
    set(&RESOLUTION_OUTCOMES, &["not_found"], PipelineStats::get(&stats.commits_unresolved));
    set(&RESOLUTION_OUTCOMES, &["lookup_failed"], PipelineStats::get(&stats.lookup_failures));

    set(&PIPELINE_TOTALS, &["registrations"], PipelineStats::get(&stats.registrations));
    set(&PIPELINE_TOTALS, &["assets_added"], PipelineStats::get(&stats.assets_added));
    set(
        &PIPELINE_TOTALS,
        &["repositories_associated"],
        PipelineStats::get(&stats.repositories_associated),
    );
    set(&PIPELINE_TOTALS, &["stage_failures"], PipelineStats::get(&stats.stage_failures));
    set(&PIPELINE_TOTALS, &["lagged"], PipelineStats::get(&stats.lagged));
    set(&PIPELINE_TOTALS, &["sweeps"], PipelineStats::get(&stats.sweeps));
    set(&PIPELINE_TOTALS, &["swept_versions"], PipelineStats::get(&stats.swept_versions));
}

pub fn record_pool(pool: &str, stats: &SupervisorStats) {
    set(&WORKER_SUPERVISION, &[pool, "handled"], stats.handled());
    set(&WORKER_SUPERVISION, &[pool, "resumed"], stats.resumed());
    set(&WORKER_SUPERVISION, &[pool, "restarts"], stats.restarts());
    set(&WORKER_SUPERVISION, &[pool, "exhausted"], stats.exhausted());
    set(&WORKER_SUPERVISION, &[pool, "stopped"], stats.stopped());
}

/// Copy every service counter into the gauges
pub fn refresh(services: &Services) {
    record_resync(&services.resync.stats());
    record_pipeline(&services.pipeline.stats());
    record_pool("extraction", services.extraction.stats());
    record_pool("resolution", services.resolution.stats());
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert metrics to string: {}", e))
}
