//! Flow control configuration.
//!
//! Plain values loaded from TOML. A configuration lists controllers by
//! strategy name; the [`ControllerRegistry`](crate::ControllerRegistry) turns
//! each entry into a controller.
//!
//! ```toml
//! timeout_ms = 30000
//!
//! [reclaim]
//! max_age_ms = 10000
//!
//! [[controllers]]
//! strategy = "rate"
//! service = "wms"
//! operation = "getmap"
//! limit = 100
//! window_ms = 60000
//!
//! [[controllers]]
//! strategy = "global"
//! capacity = 32
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sluice_core::{Limits, DEFAULT_COOKIE_NAME};

use crate::error::{FlowError, FlowResult};
use crate::matcher::OwsRequestMatcher;
use crate::priority::{HttpHeaderPriorityProvider, PriorityProvider};
use crate::reclaim::ReclaimPolicy;

/// How a keyed controller partitions requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyStrategy {
    /// By client IP.
    Ip,
    /// By partition cookie.
    Cookie,
    /// By authenticated user, falling back to IP.
    User,
}

/// Header-based request priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityConfig {
    /// Header holding the priority.
    pub header: String,
    /// Priority of requests without a valid header.
    #[serde(default)]
    pub default: i32,
}

/// One controller entry.
///
/// Which fields are required depends on the strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Registered strategy name.
    pub strategy: String,
    /// Name overriding the generated one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Concurrent requests allowed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
    /// OWS service matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// OWS operation matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Output format matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
    /// Client address for the single-IP strategy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Requests allowed per window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Rate window length.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_ms: Option<u64>,
    /// Delay imposed on excess requests; absent or zero rejects them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    /// Partitioning of keyed strategies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<KeyStrategy>,
    /// Priority ordering of waiters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<PriorityConfig>,
}

impl ControllerConfig {
    /// Entry for `strategy` with no parameters.
    #[must_use]
    pub fn new(strategy: impl Into<String>) -> Self {
        Self {
            strategy: strategy.into(),
            ..Self::default()
        }
    }

    /// Sets the capacity.
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Sets the rate limit.
    #[must_use]
    pub const fn with_rate(mut self, limit: u64, window_ms: u64) -> Self {
        self.limit = Some(limit);
        self.window_ms = Some(window_ms);
        self
    }

    /// Sets the delay for excess requests.
    #[must_use]
    pub const fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    /// Sets the OWS request filter.
    #[must_use]
    pub fn with_ows(
        mut self,
        service: &str,
        operation: Option<&str>,
        output_format: Option<&str>,
    ) -> Self {
        self.service = Some(service.to_string());
        self.operation = operation.map(str::to_string);
        self.output_format = output_format.map(str::to_string);
        self
    }

    /// Sets the client address.
    #[must_use]
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Sets the key strategy.
    #[must_use]
    pub const fn with_key(mut self, key: KeyStrategy) -> Self {
        self.key = Some(key);
        self
    }

    /// Orders waiters by `header`.
    #[must_use]
    pub fn with_priority(mut self, header: impl Into<String>, default: i32) -> Self {
        self.priority = Some(PriorityConfig {
            header: header.into(),
            default,
        });
        self
    }

    fn missing(&self, field: &str) -> FlowError {
        FlowError::invalid_config(format!("{} controller: missing {field}", self.strategy))
    }

    /// The capacity, which must be set.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::InvalidConfig` if absent.
    pub fn require_capacity(&self) -> FlowResult<usize> {
        self.capacity.ok_or_else(|| self.missing("capacity"))
    }

    /// The rate limit and window, which must be set.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::InvalidConfig` if either is absent.
    pub fn require_rate(&self) -> FlowResult<(u64, u64)> {
        let limit = self.limit.ok_or_else(|| self.missing("limit"))?;
        let window_ms = self.window_ms.ok_or_else(|| self.missing("window_ms"))?;
        Ok((limit, window_ms))
    }

    /// The client address, which must be set.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::InvalidConfig` if absent.
    pub fn require_ip(&self) -> FlowResult<&str> {
        self.ip.as_deref().ok_or_else(|| self.missing("ip"))
    }

    /// The OWS matcher described by this entry.
    ///
    /// # Errors
    ///
    /// Returns `FlowError::InvalidConfig` if the service, operation and
    /// format do not specialize one another.
    pub fn matcher(&self) -> FlowResult<OwsRequestMatcher> {
        OwsRequestMatcher::new(
            self.service.as_deref(),
            self.operation.as_deref(),
            self.output_format.as_deref(),
        )
    }

    /// The priority provider, if configured.
    #[must_use]
    pub fn priority_provider(&self) -> Option<Arc<dyn PriorityProvider>> {
        self.priority.as_ref().map(|p| {
            let provider = HttpHeaderPriorityProvider::new(p.header.clone(), p.default);
            Arc::new(provider) as Arc<dyn PriorityProvider>
        })
    }
}

/// Complete flow control configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Timeout for one request's admission walk; zero or negative waits
    /// forever.
    pub timeout_ms: i64,
    /// Whether admitted requests get the admission delay header.
    pub delay_header: bool,
    /// Partition cookie name.
    pub cookie_name: String,
    /// Max-age of minted partition cookies.
    pub cookie_max_age_secs: u64,
    /// Reclamation of per-key state.
    pub reclaim: ReclaimPolicy,
    /// Controllers, in any order.
    pub controllers: Vec<ControllerConfig>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self::from_limits(&Limits::new())
    }
}

impl FlowConfig {
    /// Configuration with the defaults taken from `limits`.
    #[must_use]
    pub fn from_limits(limits: &Limits) -> Self {
        Self {
            timeout_ms: i64::try_from(limits.default_timeout_ms).unwrap_or(i64::MAX),
            delay_header: true,
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            cookie_max_age_secs: limits.cookie_max_age_secs,
            reclaim: ReclaimPolicy::from_limits(limits),
            controllers: Vec::new(),
        }
    }

    /// Loads a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> FlowResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| FlowError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;
        Self::from_toml(&contents)
    }

    /// Parses a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(toml: &str) -> FlowResult<Self> {
        toml::from_str(toml).map_err(|e| FlowError::Parse {
            message: e.to_string(),
        })
    }

    /// Serializes the configuration to TOML.
    #[must_use]
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Adds a controller entry.
    #[must_use]
    pub fn with_controller(mut self, controller: ControllerConfig) -> Self {
        self.controllers.push(controller);
        self
    }
}
