//! Request matchers.
//!
//! A matcher selects the requests a controller governs. Its `Display` form is
//! published as the rate-limit context, so it must be short and stable.

use std::fmt;
use std::net::IpAddr;

use sluice_core::Request;

use crate::error::{FlowError, FlowResult};
use crate::key::IpKeyGenerator;

/// Selects the requests a controller applies to.
pub trait RequestMatcher: Send + Sync + fmt::Debug + fmt::Display {
    /// Returns whether `request` is governed by the owning controller.
    fn matches(&self, request: &dyn Request) -> bool;
}

/// Matches every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyRequest;

impl RequestMatcher for AnyRequest {
    fn matches(&self, _request: &dyn Request) -> bool {
        true
    }
}

impl fmt::Display for AnyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Any OGC request")
    }
}

/// Matches OGC requests by service, operation and output format.
///
/// Each level specializes the previous one: an operation requires a service
/// and an output format requires an operation. All comparisons ignore case.
/// A matcher with no service matches everything.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OwsRequestMatcher {
    service: Option<String>,
    operation: Option<String>,
    output_format: Option<String>,
}

impl OwsRequestMatcher {
    /// Creates a matcher.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::InvalidConfig` if an operation is given without a
    /// service, or an output format without an operation.
    pub fn new(
        service: Option<&str>,
        operation: Option<&str>,
        output_format: Option<&str>,
    ) -> FlowResult<Self> {
        let service = normalize(service);
        let operation = normalize(operation);
        let output_format = normalize(output_format);

        if service.is_none() && operation.is_some() {
            return Err(FlowError::invalid_config(
                "invalid request matcher: operation specified without a service",
            ));
        }
        if operation.is_none() && output_format.is_some() {
            return Err(FlowError::invalid_config(
                "invalid request matcher: output format specified without an operation",
            ));
        }

        Ok(Self {
            service,
            operation,
            output_format,
        })
    }

    /// A matcher that accepts every request.
    #[must_use]
    pub const fn any() -> Self {
        Self {
            service: None,
            operation: None,
            output_format: None,
        }
    }

    /// Matcher for a whole service.
    ///
    /// # Errors
    ///
    /// Never fails for a non-empty service; kept fallible for symmetry.
    pub fn service(service: &str) -> FlowResult<Self> {
        Self::new(Some(service), None, None)
    }

    /// Matcher for one operation of a service.
    ///
    /// # Errors
    ///
    /// Returns an error if `service` is empty while `operation` is not.
    pub fn operation(service: &str, operation: &str) -> FlowResult<Self> {
        Self::new(Some(service), Some(operation), None)
    }

    /// Returns whether this matcher accepts every request.
    #[must_use]
    pub const fn is_any(&self) -> bool {
        self.service.is_none()
    }
}

/// Empty or blank strings count as absent; stored values are lowercased.
fn normalize(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_ascii_lowercase)
}

fn same(expected: Option<&String>, actual: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(expected) => actual.is_some_and(|a| a.eq_ignore_ascii_case(expected)),
    }
}

impl RequestMatcher for OwsRequestMatcher {
    fn matches(&self, request: &dyn Request) -> bool {
        if self.service.is_none() {
            return true;
        }
        same(self.service.as_ref(), request.service())
            && same(self.operation.as_ref(), request.operation())
            && same(self.output_format.as_ref(), request.output_format())
    }
}

impl fmt::Display for OwsRequestMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(service) = &self.service else {
            return f.write_str("Any OGC request");
        };
        f.write_str(service)?;
        if let Some(operation) = &self.operation {
            write!(f, ".{operation}")?;
        }
        if let Some(format) = &self.output_format {
            write!(f, ".{format}")?;
        }
        Ok(())
    }
}

/// Matches requests coming from one client address.
///
/// The client address is resolved like [`IpKeyGenerator`] does, so proxied
/// requests are attributed to the forwarded client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingleIpMatcher {
    ip: IpAddr,
}

impl SingleIpMatcher {
    /// Creates a matcher for `ip`.
    #[must_use]
    pub const fn new(ip: IpAddr) -> Self {
        Self { ip }
    }

    /// Parses the address to match.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::InvalidConfig` if `ip` is not an IP address.
    pub fn parse(ip: &str) -> FlowResult<Self> {
        ip.trim()
            .parse()
            .map(Self::new)
            .map_err(|e| FlowError::invalid_config(format!("invalid ip address '{ip}': {e}")))
    }

    /// The matched address.
    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl RequestMatcher for SingleIpMatcher {
    fn matches(&self, request: &dyn Request) -> bool {
        IpKeyGenerator::client_ip(request)
            .parse::<IpAddr>()
            .is_ok_and(|client| client == self.ip)
    }
}

impl fmt::Display for SingleIpMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ip.{}", self.ip)
    }
}
