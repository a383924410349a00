//! Pluggable hook onto a system thread-dump facility, consulted once per
//! soft-deadline firing before any of the normal escalation steps run. Real
//! cycle detection (walking held-lock/waiting-on graphs across OS threads)
//! is outside this crate's scope -- it lives wherever the servlet engine's
//! thread pool does -- so this is an injection seam, not an implementation.

use std::fmt;

/// One worker-wait cycle as reported by a thread-dump facility, already
/// formatted for inclusion in a fatal log line and the response body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadlockCycle(pub String);

impl fmt::Display for DeadlockCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Consulted before a soft deadline escalates through its grace periods. A
/// facility that finds a cycle short-circuits the rest of the deadline
/// pipeline: the request is finalized immediately with `LogFatalDeath`
/// rather than waiting out grace periods that a deadlocked handler could
/// never use anyway.
pub trait DeadlockDetector: Send + Sync {
    fn detect_cycle(&self, request_id: request_context::RequestId) -> Option<DeadlockCycle>;
}

/// The default: no thread-dump facility wired in, so nothing is ever
/// reported. Plugged in by `RequestManager::new`; swap via
/// `RequestManager::with_deadlock_detector` in environments that have one.
pub struct NoDeadlockDetector;

impl DeadlockDetector for NoDeadlockDetector {
    fn detect_cycle(&self, _request_id: request_context::RequestId) -> Option<DeadlockCycle> {
        None
    }
}

#[cfg(test)]
pub(crate) struct FixedDeadlockDetector(pub Option<DeadlockCycle>);

#[cfg(test)]
impl DeadlockDetector for FixedDeadlockDetector {
    fn detect_cycle(&self, _request_id: request_context::RequestId) -> Option<DeadlockCycle> {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_detector_never_reports_a_cycle() {
        let detector = NoDeadlockDetector;
        assert_eq!(detector.detect_cycle(request_context::RequestId::new_for_test()), None);
    }
}
