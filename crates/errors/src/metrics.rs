use metrics::register_runtime_counter;

register_runtime_counter!(pub BAD_REQUEST_ERROR_TOTAL, "Count of bad request errors");
register_runtime_counter!(pub CLIENT_DISCONNECT_ERROR_TOTAL, "Count of client disconnect errors");
register_runtime_counter!(pub SYNC_AUTH_ERROR_TOTAL, "Count of sync auth errors");
register_runtime_counter!(pub FORBIDDEN_ERROR_TOTAL, "Count of forbidden errors");
