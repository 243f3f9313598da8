//! Prometheus text exposition for checkpoint metrics
//!
//! Served at /metrics by the API server. Every series carries a `site` label.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::services::history::PassStats;
use std::fmt::Write;

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {cumulative}");
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(
    metrics: &Metrics,
    passes: &PassStats,
    quarantined_plates: usize,
    site_id: &str,
) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_pass_metrics(&mut output, site_id, &summary, passes, quarantined_plates);
    write_guard_metrics(&mut output, site_id, &summary);
    write_scan_metrics(&mut output, site_id, &summary);

    output
}

fn write_pass_metrics(
    output: &mut String,
    site: &str,
    summary: &MetricsSummary,
    passes: &PassStats,
    quarantined_plates: usize,
) {
    write_metric(
        output,
        "gatepass_passes_registered_total",
        "Passes issued",
        MetricType::Counter,
        site,
        summary.passes_registered,
    );
    write_metric(
        output,
        "gatepass_codes_verified_total",
        "Entry codes accepted at the gate",
        MetricType::Counter,
        site,
        summary.codes_verified,
    );
    write_metric(
        output,
        "gatepass_codes_rejected_total",
        "Entry codes rejected at the gate",
        MetricType::Counter,
        site,
        summary.verify_rejected,
    );
    write_metric(
        output,
        "gatepass_entries_total",
        "Confirmed entries",
        MetricType::Counter,
        site,
        summary.entries_confirmed,
    );
    write_metric(
        output,
        "gatepass_exits_total",
        "Confirmed exits",
        MetricType::Counter,
        site,
        summary.exits_confirmed,
    );

    let _ = writeln!(output, "# HELP gatepass_passes Stored passes by status");
    let _ = writeln!(output, "# TYPE gatepass_passes gauge");
    for (status, count) in
        [("PENDING", passes.pending), ("INSIDE", passes.inside), ("EXITED", passes.exited)]
    {
        let _ = writeln!(output, "gatepass_passes{{site=\"{site}\",status=\"{status}\"}} {count}");
    }

    write_metric(
        output,
        "gatepass_quarantined_plates",
        "Plates blocked after an integrity fault",
        MetricType::Gauge,
        site,
        quarantined_plates as u64,
    );
}

fn write_guard_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "gatepass_transition_conflicts_total",
        "Transitions lost to a concurrent update",
        MetricType::Counter,
        site,
        summary.transition_conflicts,
    );
    write_metric(
        output,
        "gatepass_plate_conflicts_total",
        "Entries rejected because the plate was already inside",
        MetricType::Counter,
        site,
        summary.plate_conflicts,
    );
    write_metric(
        output,
        "gatepass_unknown_plates_total",
        "Exits for plates with no active pass",
        MetricType::Counter,
        site,
        summary.unknown_plates,
    );
    write_metric(
        output,
        "gatepass_integrity_faults_total",
        "Plates held by more than one active pass",
        MetricType::Counter,
        site,
        summary.integrity_faults,
    );
    write_metric(
        output,
        "gatepass_store_failures_total",
        "Operations failed by the pass store",
        MetricType::Counter,
        site,
        summary.store_failures,
    );
}

fn write_scan_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "gatepass_scans_total",
        "Plate scans started",
        MetricType::Counter,
        site,
        summary.scans_started,
    );
    write_metric(
        output,
        "gatepass_scans_succeeded_total",
        "Plate scans that recognized a plate",
        MetricType::Counter,
        site,
        summary.scans_succeeded,
    );
    write_metric(
        output,
        "gatepass_scans_exhausted_total",
        "Plate scans that ran out of attempts",
        MetricType::Counter,
        site,
        summary.scans_exhausted,
    );
    write_metric(
        output,
        "gatepass_scans_cancelled_total",
        "Plate scans cancelled by the operator",
        MetricType::Counter,
        site,
        summary.scans_cancelled,
    );
    write_metric(
        output,
        "gatepass_recognition_failures_total",
        "Recognition attempts that missed, failed or timed out",
        MetricType::Counter,
        site,
        summary.recognition_failures,
    );

    write_histogram(
        output,
        "gatepass_recognition_latency_ms",
        "Recognition attempt latency in milliseconds",
        site,
        &summary.recognition_latency_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.recognition_latency_sum_ms,
    );
    write_metric(
        output,
        "gatepass_recognition_latency_p50_ms",
        "50th percentile recognition attempt latency",
        MetricType::Gauge,
        site,
        summary.recognition_latency_p50_ms,
    );
    write_metric(
        output,
        "gatepass_recognition_latency_p99_ms",
        "99th percentile recognition attempt latency",
        MetricType::Gauge,
        site,
        summary.recognition_latency_p99_ms,
    );
    write_metric(
        output,
        "gatepass_recognition_latency_max_ms",
        "Slowest recognition attempt",
        MetricType::Gauge,
        site,
        summary.recognition_latency_max_ms,
    );
}
