//! Per-request retry automaton.

use http::Method;

/// What the request loop does after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// Try the request once more.
    Retry,
    /// Surface the failure.
    GiveUp,
}

/// Retry bookkeeping for one logical request.
///
/// Bad responses and transient failures are counted separately. Each
/// class gets at most one retry, and only for eligible requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    eligible: bool,
    bad_response_retried: bool,
    reset_retried: bool,
}

impl RetryState {
    /// Start tracking a request. `eligible` comes from [`can_retry`].
    pub fn new(eligible: bool) -> Self {
        Self {
            eligible,
            bad_response_retried: false,
            reset_retried: false,
        }
    }

    /// Record a malformed response.
    pub fn on_bad_response(&mut self) -> Attempt {
        if !self.eligible || self.bad_response_retried {
            return Attempt::GiveUp;
        }
        self.bad_response_retried = true;
        Attempt::Retry
    }

    /// Record a transient transport failure.
    pub fn on_transient_failure(&mut self) -> Attempt {
        if !self.eligible || self.reset_retried {
            return Attempt::GiveUp;
        }
        self.reset_retried = true;
        Attempt::Retry
    }

    /// Whether a transient failure has already been retried.
    pub fn reset_retried(&self) -> bool {
        self.reset_retried
    }

    /// Whether a bad response has already been retried.
    pub fn bad_response_retried(&self) -> bool {
        self.bad_response_retried
    }
}

/// Check if repeating `method` has no additional side effects.
pub fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::DELETE | Method::OPTIONS | Method::PUT | Method::TRACE
    )
}

/// Check if a request with `method` may be retried.
pub fn can_retry(method: &Method, retry_non_idempotent: bool) -> bool {
    is_idempotent(method) || retry_non_idempotent
}
