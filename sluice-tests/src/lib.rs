//! Sluice Tests - concurrent integration tests for Sluice flow control.
//!
//! This crate contains the multi-component and stress tests for Sluice. Tests
//! are organized by component:
//!
//! ## Test Organization
//!
//! **Integration Tests** (`*_tests.rs`): Multi-component integration
//! - `blocker_tests`: capacity, FIFO fairness, priority order, timeout races
//! - `controller_tests`: keyed, single-IP and rate controllers under load
//! - `pipeline_tests`: ordering, rollback, shared timeout budget
//! - `reclaim_tests`: idle key reclamation, inline and background
//! - `config_tests`: TOML configuration to running pipeline
//!
//! **Support Modules**:
//! - `properties`: property definitions (`CapacityExceeded`, `NotDrained`, etc.)
//! - `scenarios`: reusable clients, pipelines and seeds
//!
//! ## Naming Conventions
//!
//! - Integration tests: `test_<component>_<scenario>`
//! - Stress tests: `test_stress_<component>_<scenario>`
//! - Unit tests: Inline in each crate under `#[cfg(test)]`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod properties;
pub mod scenarios;

// Integration test modules (multi-component tests).
#[cfg(test)]
mod blocker_tests;
