//! Partition key generators.
//!
//! A key generator maps a request to the client or user it belongs to. The key
//! is computed once per controller per request and must be stable for the
//! request's lifetime.

use std::fmt;

use sluice_core::{Cookie, PartitionKey, Request, DEFAULT_COOKIE_NAME};
use tracing::debug;

const FORWARDED_FOR: &str = "X-Forwarded-For";
const REAL_IP: &str = "X-Real-IP";
const UNKNOWN_CLIENT: &str = "unknown";

/// Derives the partition key of a request.
///
/// Takes the request mutably because some generators publish the key back
/// to the client (see [`CookieKeyGenerator`]).
pub trait KeyGenerator: Send + Sync + fmt::Debug {
    /// Returns the key for `request`.
    fn key_for(&self, request: &mut dyn Request) -> PartitionKey;
}

/// Keys requests by client IP.
///
/// Uses the first entry of `X-Forwarded-For`, then `X-Real-IP`, then the
/// peer address.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpKeyGenerator;

impl IpKeyGenerator {
    /// Returns the client address of `request` as a string.
    #[must_use]
    pub fn client_ip(request: &dyn Request) -> String {
        if let Some(forwarded) = request.header(FORWARDED_FOR) {
            if let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty()) {
                return first.to_string();
            }
        }
        if let Some(real) = request.header(REAL_IP).map(str::trim).filter(|s| !s.is_empty()) {
            return real.to_string();
        }
        request
            .remote_addr()
            .map_or_else(|| UNKNOWN_CLIENT.to_string(), |addr| addr.to_string())
    }
}

impl KeyGenerator for IpKeyGenerator {
    fn key_for(&self, request: &mut dyn Request) -> PartitionKey {
        PartitionKey::from(Self::client_ip(request))
    }
}

/// Keys requests by a partition cookie.
///
/// When the request carries no cookie a fresh random value is minted and added
/// to the response so the client sends it back next time. A value minted
/// earlier in the same request is reused, so several cookie-keyed controllers
/// agree on one key.
#[derive(Debug, Clone)]
pub struct CookieKeyGenerator {
    cookie_name: String,
    max_age_secs: Option<u64>,
}

impl CookieKeyGenerator {
    /// Creates a generator for `cookie_name`.
    #[must_use]
    pub fn new(cookie_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            max_age_secs: None,
        }
    }

    /// Sets the max-age attached to minted cookies.
    #[must_use]
    pub const fn with_max_age(mut self, secs: u64) -> Self {
        self.max_age_secs = Some(secs);
        self
    }

    /// Name of the cookie read and written.
    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    fn mint() -> String {
        format!("{:032x}", rand::random::<u128>())
    }
}

impl Default for CookieKeyGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_COOKIE_NAME)
    }
}

impl KeyGenerator for CookieKeyGenerator {
    fn key_for(&self, request: &mut dyn Request) -> PartitionKey {
        if let Some(value) = request.cookie(&self.cookie_name) {
            return PartitionKey::new(value);
        }
        if let Some(value) = request.response().cookie(&self.cookie_name) {
            return PartitionKey::new(value);
        }

        let value = Self::mint();
        debug!(request = %request.id(), cookie = %self.cookie_name, "minted partition cookie");
        let mut cookie = Cookie::new(self.cookie_name.clone(), value.clone());
        if let Some(secs) = self.max_age_secs {
            cookie = cookie.with_max_age(secs);
        }
        request.response_mut().add_cookie(cookie);
        PartitionKey::from(value)
    }
}

/// Keys requests by authenticated user, falling back to the client IP for
/// anonymous requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserKeyGenerator;

impl KeyGenerator for UserKeyGenerator {
    fn key_for(&self, request: &mut dyn Request) -> PartitionKey {
        match request.user().filter(|u| !u.is_empty()) {
            Some(user) => PartitionKey::new(format!("user:{user}")),
            None => PartitionKey::new(format!("ip:{}", IpKeyGenerator::client_ip(request))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::HttpRequest;
    use std::net::{IpAddr, Ipv4Addr};

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));

    #[test]
    fn test_ip_key_prefers_forwarded_for() {
        let mut req = HttpRequest::new()
            .with_remote_addr(PEER)
            .with_header("X-Forwarded-For", "192.168.1.1, 10.1.1.1");
        assert_eq!(IpKeyGenerator.key_for(&mut req).as_str(), "192.168.1.1");
    }

    #[test]
    fn test_ip_key_real_ip_then_peer() {
        let mut req = HttpRequest::new()
            .with_remote_addr(PEER)
            .with_header("X-Real-IP", "172.16.0.3");
        assert_eq!(IpKeyGenerator.key_for(&mut req).as_str(), "172.16.0.3");

        let mut req = HttpRequest::new().with_remote_addr(PEER);
        assert_eq!(IpKeyGenerator.key_for(&mut req).as_str(), "10.0.0.7");

        let mut req = HttpRequest::new();
        assert_eq!(IpKeyGenerator.key_for(&mut req).as_str(), "unknown");
    }

    #[test]
    fn test_cookie_key_reads_existing_cookie() {
        let generator = CookieKeyGenerator::default();
        let mut req = HttpRequest::new().with_cookie(DEFAULT_COOKIE_NAME, "abc123");
        assert_eq!(generator.key_for(&mut req).as_str(), "abc123");
        assert!(req.response().cookies().is_empty());
    }

    #[test]
    fn test_cookie_key_mints_once_per_request() {
        let generator = CookieKeyGenerator::default().with_max_age(3600);
        let mut req = HttpRequest::new();
        let first = generator.key_for(&mut req);
        let second = generator.key_for(&mut req);
        assert_eq!(first, second);
        assert_eq!(first.as_str().len(), 32);

        let cookies = req.response().cookies();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].name, DEFAULT_COOKIE_NAME);
        assert_eq!(cookies[0].value, first.as_str());
        assert_eq!(cookies[0].max_age_secs, Some(3600));
    }

    #[test]
    fn test_cookie_keys_differ_across_clients() {
        let generator = CookieKeyGenerator::default();
        let a = generator.key_for(&mut HttpRequest::new());
        let b = generator.key_for(&mut HttpRequest::new());
        assert_ne!(a, b);
    }

    #[test]
    fn test_user_key_falls_back_to_ip() {
        let mut req = HttpRequest::new().with_remote_addr(PEER).with_user("alice");
        assert_eq!(UserKeyGenerator.key_for(&mut req).as_str(), "user:alice");

        let mut anon = HttpRequest::new().with_remote_addr(PEER);
        assert_eq!(UserKeyGenerator.key_for(&mut anon).as_str(), "ip:10.0.0.7");
    }
}
