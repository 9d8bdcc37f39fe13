//! Workload profiles for load testing.
//!
//! A profile describes the synthetic clients, the request mix they send and
//! the flow-control configuration they run against, with sensible defaults
//! for different testing scenarios.
//!
//! # Example
//!
//! ```ignore
//! use sluice_workload::profiles::{load_profile, WorkloadProfile};
//!
//! // Load a named profile
//! let profile = load_profile("per-client").unwrap();
//!
//! // Or load from a TOML file
//! let profile = WorkloadProfile::from_file("custom.toml").unwrap();
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sluice_flow::{ControllerConfig, FlowConfig};

/// Synthetic client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Number of client threads.
    pub clients: usize,
    /// Distinct client addresses; clients share an address round-robin.
    pub keys: usize,
    /// Requests each client sends.
    pub requests_per_client: u64,
    /// Time an admitted request holds its slots.
    pub hold_ms: u64,
    /// Random extra hold time, up to this many milliseconds.
    pub hold_jitter_ms: u64,
    /// Header carrying a random priority, if any.
    pub priority_header: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            clients: 8,
            keys: 4,
            requests_per_client: 50,
            hold_ms: 2,
            hold_jitter_ms: 2,
            priority_header: None,
        }
    }
}

/// Relative weights of the requests clients send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestMix {
    /// WMS `GetMap`.
    pub getmap: u32,
    /// WFS `GetFeature`.
    pub getfeature: u32,
    /// WCS `GetCoverage`.
    pub getcoverage: u32,
}

impl Default for RequestMix {
    fn default() -> Self {
        Self {
            getmap: 6,
            getfeature: 3,
            getcoverage: 1,
        }
    }
}

impl RequestMix {
    /// Weights in `(service, operation, weight)` form.
    #[must_use]
    pub const fn weighted(&self) -> [(&'static str, &'static str, u32); 3] {
        [
            ("WMS", "GetMap", self.getmap),
            ("WFS", "GetFeature", self.getfeature),
            ("WCS", "GetCoverage", self.getcoverage),
        ]
    }
}

/// Test execution configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Random seed; each client derives its own stream from it.
    pub seed: u64,
    /// Period of the background reclaimer; zero disables it.
    pub reclaim_period_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            reclaim_period_ms: 100,
        }
    }
}

/// A complete workload profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadProfile {
    /// Profile name.
    pub name: String,
    /// Description of what this profile tests.
    pub description: String,
    /// Client configuration.
    pub clients: ClientConfig,
    /// Request mix.
    pub mix: RequestMix,
    /// Execution configuration.
    pub execution: ExecutionConfig,
    /// Flow control under test.
    pub flow: FlowConfig,
}

impl Default for WorkloadProfile {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            description: "Default workload profile".to_string(),
            clients: ClientConfig::default(),
            mix: RequestMix::default(),
            execution: ExecutionConfig::default(),
            flow: FlowConfig::default()
                .with_controller(ControllerConfig::new("global").with_capacity(4)),
        }
    }
}

impl WorkloadProfile {
    /// Load a profile from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ProfileError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| ProfileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;
        Self::from_toml(&contents)
    }

    /// Parse a profile from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML cannot be parsed.
    pub fn from_toml(toml: &str) -> Result<Self, ProfileError> {
        toml::from_str(toml).map_err(|e| ProfileError::Parse {
            message: e.to_string(),
        })
    }

    /// Serialize the profile to a TOML string.
    #[must_use]
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Total requests the profile sends.
    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.clients.requests_per_client * self.clients.clients as u64
    }
}

/// Error type for profile operations.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    /// I/O error reading profile file.
    #[error("failed to read profile from {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Parse error in TOML.
    #[error("failed to parse profile: {message}")]
    Parse {
        /// Error message.
        message: String,
    },
    /// Profile not found.
    #[error("profile not found: {name}")]
    NotFound {
        /// Profile name.
        name: String,
    },
}

fn profile(
    name: &str,
    desc: &str,
    clients: usize,
    keys: usize,
    requests: u64,
    timeout_ms: i64,
    controllers: Vec<ControllerConfig>,
) -> WorkloadProfile {
    WorkloadProfile {
        name: name.to_string(),
        description: desc.to_string(),
        clients: ClientConfig {
            clients,
            keys,
            requests_per_client: requests,
            ..ClientConfig::default()
        },
        mix: RequestMix::default(),
        execution: ExecutionConfig::default(),
        flow: FlowConfig {
            timeout_ms,
            controllers,
            ..FlowConfig::default()
        },
    }
}

/// Built-in workload profiles for common testing scenarios.
#[must_use]
pub fn builtin_profiles() -> HashMap<&'static str, WorkloadProfile> {
    let global = |capacity| ControllerConfig::new("global").with_capacity(capacity);
    let ip = |capacity| ControllerConfig::new("ip").with_capacity(capacity);

    let baseline = profile(
        "baseline",
        "Quick sanity check against one global limit",
        4,
        4,
        20,
        0,
        vec![global(2)],
    );
    let per_client = profile(
        "per-client",
        "Per-address limits under a wider global limit",
        16,
        4,
        40,
        0,
        vec![ip(2), global(6)],
    );
    let ows_mix = profile(
        "ows-mix",
        "Service-specific limits for a mixed request stream",
        12,
        6,
        40,
        0,
        vec![
            ControllerConfig::new("ows").with_ows("WMS", Some("GetMap"), None).with_capacity(2),
            ControllerConfig::new("ows").with_ows("WFS", None, None).with_capacity(1),
            global(4),
        ],
    );
    let rate = profile(
        "rate",
        "Per-address rate limits in front of a global limit",
        8,
        4,
        30,
        200,
        vec![ControllerConfig::new("rate").with_rate(10, 1000), global(4)],
    );
    let mut stress = profile(
        "stress",
        "Many clients, short timeouts, priority waiters",
        32,
        16,
        100,
        50,
        vec![ip(1), global(8).with_priority("gs-priority", 0)],
    );
    stress.clients.priority_header = Some("gs-priority".to_string());

    HashMap::from([
        ("baseline", baseline),
        ("per-client", per_client),
        ("ows-mix", ows_mix),
        ("rate", rate),
        ("stress", stress),
    ])
}

/// Load a built-in profile by name.
///
/// # Errors
///
/// Returns an error if the profile name is not found.
pub fn load_profile(name: &str) -> Result<WorkloadProfile, ProfileError> {
    builtin_profiles()
        .remove(name)
        .ok_or_else(|| ProfileError::NotFound {
            name: name.to_string(),
        })
}

/// List all available built-in profile names.
#[must_use]
pub fn list_profiles() -> Vec<&'static str> {
    let mut names: Vec<_> = builtin_profiles().keys().copied().collect();
    names.sort_unstable();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_flow::ControllerRegistry;

    #[test]
    fn test_default_profile() {
        let profile = WorkloadProfile::default();
        assert_eq!(profile.clients.clients, 8);
        assert_eq!(profile.total_requests(), 400);
        assert_eq!(profile.flow.controllers.len(), 1);
    }

    #[test]
    fn test_builtin_profiles_build() {
        let registry = ControllerRegistry::default();
        for name in list_profiles() {
            let profile = load_profile(name).unwrap();
            assert_eq!(profile.name, name);
            assert!(registry.build_pipeline(&profile.flow).is_ok(), "{name}");
        }
        assert_eq!(list_profiles(), vec!["baseline", "ows-mix", "per-client", "rate", "stress"]);
    }

    #[test]
    fn test_stress_profile_sends_priorities() {
        let profile = load_profile("stress").unwrap();
        assert_eq!(profile.clients.priority_header.as_deref(), Some("gs-priority"));
    }

    #[test]
    fn test_profile_not_found() {
        let result = load_profile("nonexistent");
        assert!(matches!(result, Err(ProfileError::NotFound { .. })));
    }

    #[test]
    fn test_toml_roundtrip() {
        let profile = load_profile("ows-mix").unwrap();
        let parsed = WorkloadProfile::from_toml(&profile.to_toml()).unwrap();
        assert_eq!(parsed, profile);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let profile = WorkloadProfile::from_toml(
            r#"
name = "tiny"

[clients]
clients = 2

[[flow.controllers]]
strategy = "ip"
capacity = 1
"#,
        )
        .unwrap();
        assert_eq!(profile.clients.clients, 2);
        assert_eq!(profile.clients.keys, 4);
        assert_eq!(profile.mix, RequestMix::default());
        assert_eq!(profile.flow.timeout_ms, 60_000);
        assert_eq!(profile.flow.controllers[0].strategy, "ip");
    }
}
