//! Prometheus text exposition for ledger and hub metrics
//!
//! Served at /metrics by the HTTP facade.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use std::fmt::Write;

/// Content type for the text exposition format
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

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
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
///
/// Latency figures cover the window since the previous report.
pub fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_ledger_metrics(&mut output, site_id, &summary);
    write_billing_metrics(&mut output, site_id, &summary);
    write_latency_metrics(&mut output, site_id, &summary);
    write_hub_metrics(&mut output, site_id, &summary);

    output
}

fn write_ledger_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "parkhub_sessions_opened_total",
        "Sessions opened",
        MetricType::Counter,
        site,
        summary.sessions_opened,
    );
    write_metric(
        output,
        "parkhub_sessions_closed_total",
        "Sessions closed with a charge",
        MetricType::Counter,
        site,
        summary.sessions_closed,
    );
    write_metric(
        output,
        "parkhub_conflicts_total",
        "Operations rejected as state conflicts",
        MetricType::Counter,
        site,
        summary.conflicts,
    );
    write_metric(
        output,
        "parkhub_not_found_total",
        "Operations naming an unknown entity",
        MetricType::Counter,
        site,
        summary.not_found,
    );
    write_metric(
        output,
        "parkhub_transient_errors_total",
        "Operations aborted by storage failure",
        MetricType::Counter,
        site,
        summary.transient_errors,
    );
    write_metric(
        output,
        "parkhub_invariant_violations_total",
        "Operations aborted by a ledger invariant check",
        MetricType::Counter,
        site,
        summary.invariant_violations,
    );
}

fn write_billing_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "parkhub_charged_amount_total",
        "Sum of charge amounts in minor currency units",
        MetricType::Counter,
        site,
        summary.charged_amount_total,
    );
    write_metric(
        output,
        "parkhub_fallback_charges_total",
        "Charges billed at the fallback rate",
        MetricType::Counter,
        site,
        summary.fallback_charges,
    );
    write_metric(
        output,
        "parkhub_charges_settled_total",
        "Charges settled by the payment collaborator",
        MetricType::Counter,
        site,
        summary.charges_settled,
    );
    write_metric(
        output,
        "parkhub_charges_failed_total",
        "Charges whose payment failed",
        MetricType::Counter,
        site,
        summary.charges_failed,
    );
}

fn write_latency_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_histogram(
        output,
        "parkhub_op_latency_us",
        "Ledger operation latency in microseconds",
        site,
        &summary.op_lat_buckets,
        summary.op_latency_avg_us,
    );
    write_metric(
        output,
        "parkhub_op_latency_p99_us",
        "99th percentile ledger operation latency",
        MetricType::Gauge,
        site,
        summary.op_lat_p99_us,
    );
    write_metric(
        output,
        "parkhub_op_latency_max_us",
        "Maximum ledger operation latency",
        MetricType::Gauge,
        site,
        summary.op_latency_max_us,
    );
}

fn write_hub_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "parkhub_events_published_total",
        "Occupancy events published by the ledger",
        MetricType::Counter,
        site,
        summary.events_published,
    );
    write_metric(
        output,
        "parkhub_events_delivered_total",
        "Occupancy events delivered to observers",
        MetricType::Counter,
        site,
        summary.events_delivered,
    );
    write_metric(
        output,
        "parkhub_observers_registered_total",
        "Observers registered",
        MetricType::Counter,
        site,
        summary.observers_registered,
    );
    write_metric(
        output,
        "parkhub_observers_dropped_total",
        "Observers removed after a delivery failure or overflow",
        MetricType::Counter,
        site,
        summary.observers_dropped,
    );
    write_metric(
        output,
        "parkhub_observers_active",
        "Currently registered observers",
        MetricType::Gauge,
        site,
        summary.observers_active,
    );
}
