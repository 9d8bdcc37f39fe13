//! The request boundary.
//!
//! The dispatch layer wraps each inbound call in something implementing
//! [`Request`]. Flow control only reads a handful of accessors and writes
//! diagnostic headers and cookies into the response sink; it never retains the
//! request beyond a single admission walk.

use std::net::IpAddr;

use crate::types::RequestId;

/// A cookie to be set on the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    /// Cookie name.
    pub name: String,
    /// Cookie value.
    pub value: String,
    /// Path attribute.
    pub path: String,
    /// Max-Age attribute in seconds, if any.
    pub max_age_secs: Option<u64>,
}

impl Cookie {
    /// Creates a cookie scoped to `/` with no max-age.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: "/".to_string(),
            max_age_secs: None,
        }
    }

    /// Sets the max-age attribute.
    #[must_use]
    pub const fn with_max_age(mut self, secs: u64) -> Self {
        self.max_age_secs = Some(secs);
        self
    }
}

/// Response-side sink for headers and cookies.
///
/// Header names compare case-insensitively. `set_header` replaces every
/// existing value of the name, `add_header` appends another one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeaders {
    headers: Vec<(String, String)>,
    cookies: Vec<Cookie>,
}

impl ResponseHeaders {
    /// Creates an empty sink.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            headers: Vec::new(),
            cookies: Vec::new(),
        }
    }

    /// Replaces all values of `name` with `value`.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    /// Appends a value for `name`.
    pub fn add_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push((name.to_string(), value.into()));
    }

    /// Returns the first value of `name`.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns every value of `name`, in insertion order.
    #[must_use]
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Returns all headers in insertion order.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Adds a cookie.
    pub fn add_cookie(&mut self, cookie: Cookie) {
        self.cookies.push(cookie);
    }

    /// Returns the value of the last cookie named `name`.
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .rev()
            .find(|c| c.name == name)
            .map(|c| c.value.as_str())
    }

    /// Returns all cookies in insertion order.
    #[must_use]
    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }
}

/// An inbound request as seen by flow control.
///
/// String accessors return `None` when the value is absent. Service, operation
/// and output format are compared case-insensitively by matchers.
pub trait Request: Send {
    /// Identity of this request.
    fn id(&self) -> RequestId;

    /// OGC service name (e.g. `WMS`).
    fn service(&self) -> Option<&str>;

    /// Operation name (e.g. `GetMap`).
    fn operation(&self) -> Option<&str>;

    /// Requested output format (e.g. `image/png`).
    fn output_format(&self) -> Option<&str>;

    /// Address of the connected peer.
    fn remote_addr(&self) -> Option<IpAddr>;

    /// First value of an HTTP request header, compared case-insensitively.
    fn header(&self, name: &str) -> Option<&str>;

    /// Value of a request cookie.
    fn cookie(&self, name: &str) -> Option<&str>;

    /// Authenticated user name, if any.
    fn user(&self) -> Option<&str>;

    /// The response sink.
    fn response(&self) -> &ResponseHeaders;

    /// The response sink, mutably.
    fn response_mut(&mut self) -> &mut ResponseHeaders;
}

/// Owned reference implementation of [`Request`].
#[derive(Debug, Clone)]
pub struct HttpRequest {
    id: RequestId,
    service: Option<String>,
    operation: Option<String>,
    output_format: Option<String>,
    remote_addr: Option<IpAddr>,
    headers: Vec<(String, String)>,
    cookies: Vec<(String, String)>,
    user: Option<String>,
    response: ResponseHeaders,
}

impl HttpRequest {
    /// Creates an empty request with a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: RequestId::next_unique(),
            service: None,
            operation: None,
            output_format: None,
            remote_addr: None,
            headers: Vec::new(),
            cookies: Vec::new(),
            user: None,
            response: ResponseHeaders::new(),
        }
    }

    /// Creates a request for `service`/`operation` from `remote_addr`.
    #[must_use]
    pub fn ows(service: &str, operation: &str, remote_addr: IpAddr) -> Self {
        Self::new()
            .with_service(service)
            .with_operation(operation)
            .with_remote_addr(remote_addr)
    }

    /// Sets the service.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Sets the operation.
    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Sets the output format.
    #[must_use]
    pub fn with_output_format(mut self, format: impl Into<String>) -> Self {
        self.output_format = Some(format.into());
        self
    }

    /// Sets the peer address.
    #[must_use]
    pub const fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Adds a request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Adds a request cookie.
    #[must_use]
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    /// Sets the authenticated user.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Consumes the request, returning what flow control wrote to the response.
    #[must_use]
    pub fn into_response(self) -> ResponseHeaders {
        self.response
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl Request for HttpRequest {
    fn id(&self) -> RequestId {
        self.id
    }

    fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    fn operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    fn output_format(&self) -> Option<&str> {
        self.output_format.as_deref()
    }

    fn remote_addr(&self) -> Option<IpAddr> {
        self.remote_addr
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    fn response(&self) -> &ResponseHeaders {
        &self.response
    }

    fn response_mut(&mut self) -> &mut ResponseHeaders {
        &mut self.response
    }
}
