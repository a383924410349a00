//! Settings pushed to a running clone over the wire, distinct from the
//! process's own startup flags ([`crate::flags::RuntimeFlags`]).

use std::collections::HashMap;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CloneSettings {
    pub max_outstanding_api_rpcs: usize,
    pub api_default_deadlines_seconds: HashMap<String, f64>,
    pub api_max_deadlines_seconds: HashMap<String, f64>,
    pub offline_api_default_deadlines_seconds: HashMap<String, f64>,
    pub offline_api_max_deadlines_seconds: HashMap<String, f64>,
}
