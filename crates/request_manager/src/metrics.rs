use metrics::{
    register_runtime_counter,
    register_runtime_histogram,
};

register_runtime_histogram!(
    REQUEST_WALL_TIME_SECONDS,
    "Wall-clock time spent serving one request"
);
register_runtime_counter!(
    REQUEST_SOFT_DEADLINE_TOTAL,
    "Requests whose soft deadline fired"
);
register_runtime_counter!(
    REQUEST_HARD_DEADLINE_TOTAL,
    "Requests whose hard deadline fired"
);
register_runtime_counter!(
    REQUEST_TERMINATE_CLONE_TOTAL,
    "Requests that set terminate_clone on their response"
);

pub fn log_request_wall_time(seconds: f64) {
    REQUEST_WALL_TIME_SECONDS.observe(seconds);
}

pub fn log_soft_deadline_fired() {
    REQUEST_SOFT_DEADLINE_TOTAL.inc();
}

pub fn log_hard_deadline_fired() {
    REQUEST_HARD_DEADLINE_TOTAL.inc();
}

pub fn log_terminate_clone() {
    REQUEST_TERMINATE_CLONE_TOTAL.inc();
}
