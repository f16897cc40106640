//! Shared error classification.
//!
//! Each module has its own `thiserror` enum, but callers (the HTTP layer,
//! the watcher) only need to know what *kind* of failure happened to decide
//! between "tell the client", "retry later" and "page someone". Every module
//! error maps onto an [`ErrorClass`] via [`Classify`].

use std::fmt;

/// Coarse failure taxonomy shared by every module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed or missing input. Client-fixable.
    Validation,
    /// No record in the expected state.
    NotFound,
    /// The record exists but is in the wrong state.
    Conflict,
    /// The chain call failed. `retryable` separates network hiccups from
    /// terminal rejections.
    Upstream { retryable: bool },
    /// Admin signature or timestamp rejected.
    Auth,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Validation => write!(f, "validation"),
            ErrorClass::NotFound => write!(f, "not_found"),
            ErrorClass::Conflict => write!(f, "conflict"),
            ErrorClass::Upstream { retryable: true } => write!(f, "upstream_retryable"),
            ErrorClass::Upstream { retryable: false } => write!(f, "upstream_terminal"),
            ErrorClass::Auth => write!(f, "auth"),
            ErrorClass::Internal => write!(f, "internal"),
        }
    }
}

/// Implemented by every module error.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}
