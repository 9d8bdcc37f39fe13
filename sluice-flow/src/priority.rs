//! Request priorities for priority-ordered blockers.
//!
//! Larger values are served first. Priorities are not required to be distinct;
//! ties are broken by arrival order.

use std::fmt;

use sluice_core::Request;
use tracing::warn;

/// Assigns a priority to a request.
pub trait PriorityProvider: Send + Sync + fmt::Debug {
    /// Returns the priority of `request`. Must not fail.
    fn priority_for(&self, request: &dyn Request) -> i32;
}

/// Reads the priority from an HTTP request header.
///
/// A missing header yields the default. A malformed one is logged and also
/// yields the default; it never reaches the caller as an error.
#[derive(Debug, Clone)]
pub struct HttpHeaderPriorityProvider {
    header: String,
    default_priority: i32,
}

impl HttpHeaderPriorityProvider {
    /// Creates a provider reading `header`, falling back to `default_priority`.
    #[must_use]
    pub fn new(header: impl Into<String>, default_priority: i32) -> Self {
        Self {
            header: header.into(),
            default_priority,
        }
    }

    /// Name of the header read.
    #[must_use]
    pub fn header(&self) -> &str {
        &self.header
    }

    /// Priority used when the header is missing or malformed.
    #[must_use]
    pub const fn default_priority(&self) -> i32 {
        self.default_priority
    }
}

impl PriorityProvider for HttpHeaderPriorityProvider {
    fn priority_for(&self, request: &dyn Request) -> i32 {
        let Some(raw) = request.header(&self.header) else {
            return self.default_priority;
        };
        match raw.trim().parse::<i32>() {
            Ok(priority) => priority,
            Err(e) => {
                warn!(
                    request = %request.id(),
                    header = %self.header,
                    value = raw,
                    error = %e,
                    "malformed priority header, using default"
                );
                self.default_priority
            }
        }
    }
}

/// Gives every request the same priority.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedPriority(pub i32);

impl PriorityProvider for FixedPriority {
    fn priority_for(&self, _request: &dyn Request) -> i32 {
        self.0
    }
}
