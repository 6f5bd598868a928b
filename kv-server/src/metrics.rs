//! Observability bootstrap (C15): install a `metrics-exporter-prometheus`
//! recorder as the global `metrics` facade recorder, the same
//! `PrometheusBuilder::build_recorder()` + install shape the teacher
//! workspace uses in its own adapter bootstrap (`readyset/src/lib.rs`).
//!
//! Installation is best-effort: a server started twice in the same
//! process (tests) would hit "recorder already installed", which is
//! logged rather than treated as fatal — metrics are diagnostic, not a
//! correctness requirement.

use metrics_exporter_prometheus::PrometheusBuilder;

pub fn install() {
    let recorder = PrometheusBuilder::new().build_recorder();
    if let Err(e) = metrics::set_global_recorder(recorder) {
        tracing::warn!(error = %e, "metrics recorder was already installed");
    }
}
