//! Per-run usage accounting and limit enforcement.

use std::error::Error;
use std::fmt;

/// Counters for one in-progress run.
///
/// The identity `total_tokens == request_tokens + response_tokens` holds at
/// every point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub requests: usize,
    pub request_tokens: usize,
    pub response_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    /// Add one completed request's deltas.
    pub fn incr(&mut self, delta: Usage) {
        self.requests += delta.requests;
        self.request_tokens += delta.request_tokens;
        self.response_tokens += delta.response_tokens;
        self.total_tokens += delta.total_tokens;
    }

    /// Snapshot used/remaining numbers against a set of limits.
    pub fn stats(&self, limits: &UsageLimits) -> SessionStats {
        SessionStats {
            used_requests: self.requests,
            used_tokens: self.total_tokens,
            remaining_requests: limits.remaining_requests(self),
            remaining_tokens: limits.remaining_tokens(self),
        }
    }
}

/// Used/remaining snapshot for logging and UIs.  `None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub used_requests: usize,
    pub used_tokens: usize,
    pub remaining_requests: Option<usize>,
    pub remaining_tokens: Option<usize>,
}

/// A request or token limit was reached.
#[derive(Debug, Clone)]
pub enum UsageLimitExceeded {
    /// The next request would exceed the request limit.
    Requests { limit: usize },
    /// The accumulated token total exceeded the token limit.
    Tokens { used: usize, limit: usize },
}

impl fmt::Display for UsageLimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsageLimitExceeded::Requests { limit } => {
                write!(f, "the next request would exceed the request limit of {}", limit)
            }
            UsageLimitExceeded::Tokens { used, limit } => {
                write!(f, "token total {} exceeded the limit of {}", used, limit)
            }
        }
    }
}

impl Error for UsageLimitExceeded {}

/// Per-agent limits.  A value of `0` means "unbounded".
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageLimits {
    pub request_limit: usize,
    pub total_tokens_limit: usize,
}

impl UsageLimits {
    pub fn new(request_limit: usize, total_tokens_limit: usize) -> Self {
        Self {
            request_limit,
            total_tokens_limit,
        }
    }

    /// Fail if issuing one more request would exceed the request limit.
    /// Checked before each model call.
    pub fn check_before_request(&self, usage: &Usage) -> Result<(), UsageLimitExceeded> {
        if self.request_limit != 0 && usage.requests + 1 > self.request_limit {
            return Err(UsageLimitExceeded::Requests {
                limit: self.request_limit,
            });
        }
        Ok(())
    }

    /// Fail if the accumulated token total exceeds the token limit.
    /// Checked after each model response.
    pub fn check_tokens(&self, usage: &Usage) -> Result<(), UsageLimitExceeded> {
        if self.total_tokens_limit != 0 && usage.total_tokens > self.total_tokens_limit {
            return Err(UsageLimitExceeded::Tokens {
                used: usage.total_tokens,
                limit: self.total_tokens_limit,
            });
        }
        Ok(())
    }

    /// Requests left before the limit, or `None` if unbounded.
    pub fn remaining_requests(&self, usage: &Usage) -> Option<usize> {
        if self.request_limit == 0 {
            None
        } else {
            Some(self.request_limit.saturating_sub(usage.requests))
        }
    }

    /// Tokens left before the limit, or `None` if unbounded.
    pub fn remaining_tokens(&self, usage: &Usage) -> Option<usize> {
        if self.total_tokens_limit == 0 {
            None
        } else {
            Some(self.total_tokens_limit.saturating_sub(usage.total_tokens))
        }
    }
}
