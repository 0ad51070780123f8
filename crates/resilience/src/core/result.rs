//! Result types and error handling utilities

use super::error::{BoxError, ErrorClass, ResilienceError};

/// Result type for resilience operations
pub type ResilienceResult<T> = Result<T, ResilienceError>;

/// Extension trait for operation results
pub trait ResultExt<T> {
    /// Convert to resilience result
    fn into_resilience(self) -> ResilienceResult<T>;

    /// Wrap error with custom message
    fn wrap_err(self, msg: impl Into<String>) -> ResilienceResult<T>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<BoxError>,
{
    fn into_resilience(self) -> ResilienceResult<T> {
        self.map_err(ResilienceError::from_operation)
    }

    fn wrap_err(self, msg: impl Into<String>) -> ResilienceResult<T> {
        self.map_err(|e| {
            let source = e.into();
            ResilienceError::Operation(format!("{}: {source}", msg.into()).into())
        })
    }
}

/// Inspection helpers on resilience results
pub trait ResilienceResultExt {
    /// Error classification, `None` on success
    fn error_class(&self) -> Option<ErrorClass>;

    /// Whether a gate rejected the call before the operation ran
    fn was_admission_denied(&self) -> bool;
}

impl<T> ResilienceResultExt for ResilienceResult<T> {
    fn error_class(&self) -> Option<ErrorClass> {
        self.as_ref().err().map(ResilienceError::classify)
    }

    fn was_admission_denied(&self) -> bool {
        self.as_ref()
            .err()
            .is_some_and(ResilienceError::is_admission_denied)
    }
}

/// Early-return with a configuration error.
///
/// ```rust,ignore
/// resilience_bail!(config "retry.multiplier", "must be >= 1.0, got {m}");
/// ```
#[macro_export]
macro_rules! resilience_bail {
    (config $field:expr, $($arg:tt)+) => {
        return Err($crate::ResilienceError::invalid_config($field, format!($($arg)+)))
    };
}

/// Early-return with a configuration error unless `cond` holds.
#[macro_export]
macro_rules! resilience_ensure {
    ($cond:expr, config $field:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::resilience_bail!(config $field, $($arg)+);
        }
    };
}
