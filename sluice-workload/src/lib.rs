//! Sluice Workload: verifiable load testing for flow control
//!
//! Drives a `FlowPipeline` with many synthetic clients at once and checks the
//! run for the two things that matter:
//!
//! 1. **Correctness verification** - no controller ever exceeds its capacity,
//!    every request gets exactly one outcome, everything drains
//! 2. **Performance measurement** - admission latency percentiles, throughput,
//!    how many requests each controller refused
//!
//! # Example
//!
//! ```ignore
//! use sluice_workload::{load_profile, Workload};
//!
//! let profile = load_profile("per-client")?;
//! let stats = Workload::new(profile).run()?;
//!
//! assert!(stats.violations.is_empty());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod verification;
mod workload;

pub mod profiles;

pub use profiles::{
    builtin_profiles, list_profiles, load_profile, ClientConfig, ExecutionConfig, ProfileError,
    RequestMix, WorkloadProfile,
};
pub use verification::{Verification, Violation};
pub use workload::{client_addr, Workload, WorkloadError, WorkloadStats};
