use std::borrow::Cow;

use prometheus::IntCounter;

mod metrics;

/// `ErrorMetadata` can be attached to an anyhow error chain via
/// `.context(e /* ErrorMetadata */)`. It is a generic object used across the
/// codebase to tag errors with information used to classify them.
///
/// The msg is conveyed as a user facing error message if it makes it to the
/// client.
///
/// The short_msg is used as a tag - available for tests and for metrics
/// logging - to have a message that is resilient to changes in copy.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    /// The error code associated with this ErrorMetadata.
    pub code: ErrorCode,
    /// Short ScreamingCamelCase. Usable in tests for string matching
    /// w/ a standard test helper. Eg `InvalidAppId`.
    pub short_msg: Cow<'static, str>,
    /// Human readable - developer facing. Should be longer and descriptive.
    pub msg: Cow<'static, str>,
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    Unauthenticated,
    Forbidden,
    NotFound,
    ClientDisconnect,
    Overloaded,
    RejectedBeforeExecution,
    OperationalInternalServerError,
}

impl ErrorMetadata {
    /// Bad Request. Maps to 400 in HTTP.
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Resource not found. Maps to 404 in HTTP.
    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Not authenticated. Maps to 401 in HTTP.
    pub fn unauthenticated(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Unauthenticated,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Forbidden. Maps to 403 in HTTP.
    pub fn forbidden(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Forbidden,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Client disconnected the connection.
    pub fn client_disconnect() -> Self {
        Self {
            code: ErrorCode::ClientDisconnect,
            short_msg: CLIENT_DISCONNECTED.into(),
            msg: CLIENT_DISCONNECTED_MSG.into(),
        }
    }

    /// Operational Internal Server Error (maps to 500 in HTTP).
    ///
    /// Produces a very general error message for the user. Should be used in
    /// situations where the error is caused by a known operational source of
    /// downtime.
    pub fn operational_internal_server_error() -> Self {
        Self {
            code: ErrorCode::OperationalInternalServerError,
            short_msg: INTERNAL_SERVER_ERROR.into(),
            msg: INTERNAL_SERVER_ERROR_MSG.into(),
        }
    }

    /// Internal error with a user visible message indicating that the
    /// clone has hit some defensive limit. Maps to 503 in HTTP.
    ///
    /// If you do not need a custom error message, do not use this method.
    /// Instead use anyhow without any ErrorMetadata, which will automatically
    /// be shown to the user as a generic internal server error.
    pub fn overloaded(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Overloaded,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Similar to `overloaded`, but also guarantees the request was rejected
    /// before it started executing, so it is always safe to retry.
    pub fn rejected_before_execution(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::RejectedBeforeExecution,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn is_bad_request(&self) -> bool {
        self.code == ErrorCode::BadRequest
    }

    pub fn is_unauthenticated(&self) -> bool {
        self.code == ErrorCode::Unauthenticated
    }

    pub fn is_forbidden(&self) -> bool {
        self.code == ErrorCode::Forbidden
    }

    pub fn is_overloaded(&self) -> bool {
        self.code == ErrorCode::Overloaded
    }

    pub fn is_rejected_before_execution(&self) -> bool {
        self.code == ErrorCode::RejectedBeforeExecution
    }

    /// Return true if this error is deterministically caused by the calling
    /// application rather than by the clone itself.
    pub fn is_deterministic_user_error(&self) -> bool {
        match self.code {
            ErrorCode::BadRequest
            | ErrorCode::NotFound
            | ErrorCode::Unauthenticated
            | ErrorCode::Forbidden => true,
            ErrorCode::OperationalInternalServerError
            | ErrorCode::ClientDisconnect
            | ErrorCode::Overloaded
            | ErrorCode::RejectedBeforeExecution => false,
        }
    }

    fn metric_server_error_tag_value(&self) -> Option<&'static str> {
        match self.code {
            ErrorCode::BadRequest
            | ErrorCode::NotFound
            | ErrorCode::Unauthenticated
            | ErrorCode::Forbidden
            | ErrorCode::ClientDisconnect => None,
            ErrorCode::Overloaded => Some("overloaded"),
            ErrorCode::RejectedBeforeExecution => Some("rejected_before_execution"),
            ErrorCode::OperationalInternalServerError => Some("operational"),
        }
    }

    pub fn custom_metric(&self) -> Option<&'static IntCounter> {
        match self.code {
            ErrorCode::BadRequest => Some(&crate::metrics::BAD_REQUEST_ERROR_TOTAL),
            ErrorCode::ClientDisconnect => Some(&crate::metrics::CLIENT_DISCONNECT_ERROR_TOTAL),
            ErrorCode::Unauthenticated => Some(&crate::metrics::SYNC_AUTH_ERROR_TOTAL),
            ErrorCode::Forbidden => Some(&crate::metrics::FORBIDDEN_ERROR_TOTAL),
            ErrorCode::NotFound
            | ErrorCode::Overloaded
            | ErrorCode::RejectedBeforeExecution
            | ErrorCode::OperationalInternalServerError => None,
        }
    }
}

impl ErrorCode {
    pub fn http_status_code(&self) -> u16 {
        match self {
            ErrorCode::BadRequest => 400,
            ErrorCode::Unauthenticated => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::ClientDisconnect => 408,
            ErrorCode::OperationalInternalServerError => 500,
            ErrorCode::Overloaded | ErrorCode::RejectedBeforeExecution => 503,
        }
    }

    pub fn from_http_status_code(code: u16) -> Option<Self> {
        match code {
            401 => Some(ErrorCode::Unauthenticated),
            403 => Some(ErrorCode::Forbidden),
            404 => Some(ErrorCode::NotFound),
            v if (400..500).contains(&v) => Some(ErrorCode::BadRequest),
            v if (500..600).contains(&v) => Some(ErrorCode::Overloaded),
            _ => None,
        }
    }
}

/// Reasons the request-lifecycle core itself can fail a request, independent
/// of whatever `ErrorCode`/HTTP classification applies once the error
/// reaches a client. Attached to an `anyhow::Error` chain as context, the
/// same way `ErrorMetadata` is.
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    /// No running clone matches the requested app id/version.
    #[error("no running app version matches the request")]
    UnknownApp,
    /// The application code itself failed (uncaught exception, crash, etc).
    #[error("the application failed while handling the request")]
    AppFailure,
    /// The request ran past its soft deadline; the clone should be recycled
    /// but is given a grace window to finish on its own first.
    #[error("request exceeded its soft deadline")]
    SoftDeadline,
    /// The request ran past its hard deadline and was forcibly terminated.
    #[error("request exceeded its hard deadline")]
    HardDeadline,
    /// The clone could not be safely reused because one or more request
    /// threads were still running after the request completed.
    #[error("threads were still running after the request completed")]
    ThreadsStillRunning,
    /// The clone died while attempting to flush its own fatal-error log line.
    #[error("clone died while logging a fatal error")]
    LogFatalDeath,
    /// The in-flight RPC to the application was cancelled by the caller.
    #[error("the request's RPC was cancelled")]
    CancelledRpc,
}

impl RuntimeErrorKind {
    /// Whether a request failing for this reason means the clone hosting it
    /// is no longer trustworthy and must not serve further requests.
    pub fn requires_clone_termination(&self) -> bool {
        matches!(
            self,
            RuntimeErrorKind::HardDeadline
                | RuntimeErrorKind::ThreadsStillRunning
                | RuntimeErrorKind::LogFatalDeath
        )
    }
}

/// Maximum number of links in an anyhow error's cause chain we will walk
/// looking for a `RuntimeErrorKind`. Matches the defensive recursion caps
/// used elsewhere in the request lifecycle (e.g. trace stack depth).
const MAX_CAUSE_CHAIN_DEPTH: usize = 32;

/// Walks the error's cause chain (bounded, see `MAX_CAUSE_CHAIN_DEPTH`) and
/// reports whether any `RuntimeErrorKind` context attached to it demands
/// that the hosting clone be torn down rather than reused.
pub fn should_terminate_clone(err: &anyhow::Error) -> bool {
    err.chain()
        .take(MAX_CAUSE_CHAIN_DEPTH)
        .filter_map(|cause| cause.downcast_ref::<RuntimeErrorKind>())
        .any(RuntimeErrorKind::requires_clone_termination)
}

pub trait ErrorMetadataAnyhowExt {
    fn is_bad_request(&self) -> bool;
    fn is_unauthenticated(&self) -> bool;
    fn is_forbidden(&self) -> bool;
    fn is_overloaded(&self) -> bool;
    fn is_rejected_before_execution(&self) -> bool;
    fn is_deterministic_user_error(&self) -> bool;
    fn user_facing_message(&self) -> String;
    fn short_msg(&self) -> &str;
    fn msg(&self) -> &str;
    fn metric_status_tag_value(&self) -> &'static str;
    fn http_status(&self) -> u16;
    fn map_error_metadata<F: FnOnce(ErrorMetadata) -> ErrorMetadata>(self, f: F) -> Self;
    fn wrap_error_message<F>(self, f: F) -> Self
    where
        F: FnOnce(String) -> String;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn is_bad_request(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_bad_request)
    }

    fn is_unauthenticated(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_unauthenticated)
    }

    fn is_forbidden(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_forbidden)
    }

    fn is_overloaded(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_overloaded)
    }

    fn is_rejected_before_execution(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_rejected_before_execution)
    }

    /// Return true if this error is deterministically caused by the
    /// application. If so, it can be surfaced to the caller rather than
    /// retried.
    fn is_deterministic_user_error(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(ErrorMetadata::is_deterministic_user_error)
    }

    fn user_facing_message(&self) -> String {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.to_string();
        }
        INTERNAL_SERVER_ERROR_MSG.to_string()
    }

    fn short_msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.short_msg;
        }
        INTERNAL_SERVER_ERROR
    }

    fn msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.msg;
        }
        INTERNAL_SERVER_ERROR_MSG
    }

    fn metric_status_tag_value(&self) -> &'static str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e
                .metric_server_error_tag_value()
                .unwrap_or("developer_error");
        }
        "error"
    }

    fn http_status(&self) -> u16 {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.code.http_status_code();
        }
        500
    }

    fn map_error_metadata<F>(self, f: F) -> Self
    where
        F: FnOnce(ErrorMetadata) -> ErrorMetadata,
    {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>().cloned() {
            return self.context(f(e));
        }
        self
    }

    /// Wrap the underlying error message, maintaining the underlying error
    /// metadata short code if it exists.
    fn wrap_error_message<F>(self, f: F) -> Self
    where
        F: FnOnce(String) -> String,
    {
        if let Some(mut em) = self.downcast_ref::<ErrorMetadata>().cloned() {
            em.msg = f(em.msg.to_string()).into();
            return self.context(em);
        }
        let new_msg = f(self.to_string());
        self.context(new_msg)
    }
}

pub const INTERNAL_SERVER_ERROR_MSG: &str = "Your request couldn't be completed. Try again later.";
pub const INTERNAL_SERVER_ERROR: &str = "InternalServerError";
const CLIENT_DISCONNECTED_MSG: &str = "Your request couldn't be completed. Try again later.";
const CLIENT_DISCONNECTED: &str = "ClientDisconnected";

#[cfg(any(test, feature = "testing"))]
mod proptest_support {
    use proptest::prelude::*;

    use super::{
        ErrorCode,
        ErrorMetadata,
    };

    impl Arbitrary for ErrorMetadata {
        type Parameters = ();

        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            any::<ErrorCode>()
                .prop_map(|ec| match ec {
                    ErrorCode::BadRequest => ErrorMetadata::bad_request("bad", "request"),
                    ErrorCode::NotFound => ErrorMetadata::not_found("not", "found"),
                    ErrorCode::Unauthenticated => ErrorMetadata::unauthenticated("un", "auth"),
                    ErrorCode::Forbidden => ErrorMetadata::forbidden("for", "bidden"),
                    ErrorCode::Overloaded => ErrorMetadata::overloaded("overloaded", "error"),
                    ErrorCode::RejectedBeforeExecution => {
                        ErrorMetadata::rejected_before_execution(
                            "rejected_before_execution",
                            "error",
                        )
                    },
                    ErrorCode::OperationalInternalServerError => {
                        ErrorMetadata::operational_internal_server_error()
                    },
                    ErrorCode::ClientDisconnect => ErrorMetadata::client_disconnect(),
                })
                .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use proptest::prelude::*;

    use crate::{
        should_terminate_clone,
        ErrorCode,
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
        RuntimeErrorKind,
        INTERNAL_SERVER_ERROR,
    };

    proptest! {
        #![proptest_config(
            ProptestConfig { failure_persistence: None, ..ProptestConfig::default() }
        )]

        #[test]
        fn every_server_error_code_falls_back_to_internal_short_msg(
            err in any::<ErrorMetadata>()
        ) {
            if err.metric_server_error_tag_value().is_some()
                && err.code != ErrorCode::Overloaded
                && err.code != ErrorCode::RejectedBeforeExecution
            {
                prop_assert_eq!(&err.short_msg, INTERNAL_SERVER_ERROR);
            }
        }
    }

    #[test]
    fn should_terminate_clone_only_for_fatal_kinds() {
        let soft = anyhow!("boom").context(RuntimeErrorKind::SoftDeadline);
        assert!(!should_terminate_clone(&soft));

        let hard = anyhow!("boom").context(RuntimeErrorKind::HardDeadline);
        assert!(should_terminate_clone(&hard));

        let threads = anyhow!("boom").context(RuntimeErrorKind::ThreadsStillRunning);
        assert!(should_terminate_clone(&threads));
    }

    #[test]
    fn wrap_error_message_preserves_error_metadata_code() {
        let err = anyhow::Error::new(ErrorMetadata::bad_request("Bad", "original"))
            .wrap_error_message(|m| format!("wrapped: {m}"));
        assert!(err.is_bad_request());
        assert_eq!(err.msg(), "wrapped: original");
    }
}
