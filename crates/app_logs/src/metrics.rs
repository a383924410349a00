use metrics::{
    register_runtime_counter,
    register_runtime_histogram,
};

register_runtime_counter!(APP_LOGS_FLUSH_STARTED_TOTAL, "Count of app log flushes started");
register_runtime_counter!(
    APP_LOGS_FLUSH_FAILED_TOTAL,
    "Count of app log flushes that failed (logs best-effort lost)"
);
register_runtime_histogram!(
    APP_LOGS_FLUSH_BATCH_SIZE,
    "Number of lines in each app log flush batch"
);

pub fn log_flush_started(batch_size: usize) {
    APP_LOGS_FLUSH_STARTED_TOTAL.inc();
    APP_LOGS_FLUSH_BATCH_SIZE.observe(batch_size as f64);
}

pub fn log_flush_failed() {
    APP_LOGS_FLUSH_FAILED_TOTAL.inc();
}
