//! Prometheus text exposition of bridge metrics
//!
//! Served at `/metrics` by the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary};
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

fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name} {val}");
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(metrics: &Metrics) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(2048);

    write_vision_metrics(&mut output, &summary);
    write_serial_metrics(&mut output, &summary);
    write_hub_metrics(&mut output, &summary);

    output
}

fn write_vision_metrics(output: &mut String, summary: &MetricsSummary) {
    write_metric(
        output,
        "bridge_uptime_seconds",
        "Seconds since process start",
        MetricType::Gauge,
        summary.uptime_secs,
    );
    write_metric(
        output,
        "bridge_frames_published_total",
        "Camera frames written to the broadcast buffer",
        MetricType::Counter,
        summary.frames_published,
    );
    write_metric(
        output,
        "bridge_frame_capture_errors_total",
        "Camera capture failures",
        MetricType::Counter,
        summary.frame_capture_errors,
    );
    write_metric(
        output,
        "bridge_classifications_total",
        "Classifier invocations that returned a prediction",
        MetricType::Counter,
        summary.classifications,
    );
    write_metric(
        output,
        "bridge_classification_errors_total",
        "Classifier invocations that failed",
        MetricType::Counter,
        summary.classification_errors,
    );
    write_metric(
        output,
        "bridge_faces_detected_total",
        "Face detection events emitted",
        MetricType::Counter,
        summary.faces_detected,
    );
    write_metric(
        output,
        "bridge_faces_lost_total",
        "Face lost events emitted",
        MetricType::Counter,
        summary.faces_lost,
    );
    write_metric(
        output,
        "bridge_stream_viewers",
        "Open MJPEG stream viewers",
        MetricType::Gauge,
        summary.stream_viewers,
    );
}

fn write_serial_metrics(output: &mut String, summary: &MetricsSummary) {
    write_metric(
        output,
        "bridge_serial_lines_total",
        "Lines read from the serial device",
        MetricType::Counter,
        summary.serial_lines,
    );
    write_metric(
        output,
        "bridge_serial_events_total",
        "Events decoded from serial lines",
        MetricType::Counter,
        summary.serial_events,
    );
    write_metric(
        output,
        "bridge_serial_malformed_lines_total",
        "Serial lines that failed to decode",
        MetricType::Counter,
        summary.malformed_lines,
    );
}

fn write_hub_metrics(output: &mut String, summary: &MetricsSummary) {
    write_metric(
        output,
        "bridge_hub_events_published_total",
        "Events handed to the dispatch hub",
        MetricType::Counter,
        summary.hub_events_published,
    );
    write_metric(
        output,
        "bridge_hub_deliveries_dropped_total",
        "Per-subscriber deliveries dropped on a full queue",
        MetricType::Counter,
        summary.hub_deliveries_dropped,
    );
    write_metric(
        output,
        "bridge_subscribers",
        "Connected event subscribers",
        MetricType::Gauge,
        summary.subscribers,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_frame_published();
        metrics.record_serial_events(3);
        metrics.set_subscribers(2);

        let output = format_prometheus_metrics(&metrics);

        assert!(output.contains("# TYPE bridge_frames_published_total counter"));
        assert!(output.contains("bridge_frames_published_total 1\n"));
        assert!(output.contains("bridge_serial_events_total 3\n"));
        assert!(output.contains("# TYPE bridge_subscribers gauge"));
        assert!(output.contains("bridge_subscribers 2\n"));
    }
}
