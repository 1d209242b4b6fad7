// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0

// Metric names and recording helpers.
//
// Everything goes through the `metrics` facade; without an installed recorder
// (tests, embedders) the calls are no-ops. The CLI installs the Prometheus
// exporter when `observability.metrics` is enabled.

use std::time::Duration;

use crate::application::admission::PressureLevel;
use crate::domain::scan::ScanState;
use crate::domain::work::WorkState;

pub const SCANS_STARTED: &str = "argus_scans_started_total";
pub const SCANS_FINISHED: &str = "argus_scans_finished_total";
pub const EVENTS_ACCEPTED: &str = "argus_events_accepted_total";
pub const EVENTS_SUPPRESSED: &str = "argus_events_suppressed_total";
pub const WORK_ITEMS: &str = "argus_work_items_total";
pub const MODULE_EXECUTION_SECONDS: &str = "argus_module_execution_seconds";
pub const ADMISSION_QUEUE_DEPTH: &str = "argus_admission_queue_depth";
pub const ADMISSION_PRESSURE: &str = "argus_admission_pressure";
pub const RUNNING_SCANS: &str = "argus_running_scans";

pub fn scan_started() {
    metrics::counter!(SCANS_STARTED).increment(1);
}

/// Terminal transition; `state` is FINISHED, ABORTED or ERROR_FAILED.
pub fn scan_finished(state: ScanState) {
    metrics::counter!(SCANS_FINISHED, "state" => state.as_str()).increment(1);
}

pub fn event_accepted() {
    metrics::counter!(EVENTS_ACCEPTED).increment(1);
}

pub fn event_suppressed() {
    metrics::counter!(EVENTS_SUPPRESSED).increment(1);
}

pub fn work_item_finished(module: &str, state: WorkState, elapsed: Duration) {
    metrics::counter!(WORK_ITEMS, "outcome" => state.as_str()).increment(1);
    if state != WorkState::Skipped {
        metrics::histogram!(MODULE_EXECUTION_SECONDS, "module" => module.to_string())
            .record(elapsed.as_secs_f64());
    }
}

pub fn admission_snapshot(queue_depth: usize, running: usize, pressure: PressureLevel) {
    metrics::gauge!(ADMISSION_QUEUE_DEPTH).set(queue_depth as f64);
    metrics::gauge!(RUNNING_SCANS).set(running as f64);
    metrics::gauge!(ADMISSION_PRESSURE).set(pressure.as_gauge());
}
