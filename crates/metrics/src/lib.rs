//! Metric registration and reporting helpers used across the runtime.
//!
//! Metric names and help strings are validated at const-eval time via
//! [`MetricName`]/[`MetricHelp`] so a malformed metric fails to compile
//! instead of failing at registration time in production.

mod labels;
mod macros;
mod metrics;
mod reporting;
mod timer;

pub use crate::{
    labels::*,
    metrics::*,
    reporting::{
        get_desc,
        log_counter,
        log_counter_with_labels,
        log_distribution,
        log_distribution_with_labels,
        log_gauge,
        log_gauge_with_labels,
    },
    timer::{
        CancelableTimer,
        StatusTimer,
        Timer,
    },
};
