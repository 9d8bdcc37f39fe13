//! Request flow control for Sluice.
//!
//! This crate decides, for each inbound request, whether it may run now, has
//! to wait, or is refused. It includes:
//!
//! - **Thread blockers**: bounded admission with FIFO or priority wake-up.
//! - **Concurrency controllers**: global, per OWS category, per client key
//!   and per single IP.
//! - **Rate controllers**: per-key request counts over fixed windows, with
//!   rejection or delay of excess requests.
//! - **Reclamation**: inline and background sweeps of idle per-key state.
//! - **Pipeline**: ordered evaluation with guaranteed rollback.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                          FlowPipeline                              │
//! │                                                                    │
//! │  ┌──────────────┐    ┌────────────────┐    ┌────────────────────┐  │
//! │  │    Rate      │    │ Keyed / Single │    │  Global / OWS      │  │
//! │  │ Controllers  │───▶│  Controllers   │───▶│   Controllers      │  │
//! │  └──────┬───────┘    └───────┬────────┘    └─────────┬──────────┘  │
//! │         │                    │                       │             │
//! │         ▼                    ▼                       ▼             │
//! │   per-key windows     per-key blockers         shared blocker      │
//! │   (DashMap)           (DashMap + reclaim)      (ThreadBlocker)     │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Controllers are ordered by priority: rate controllers first (stricter
//! limits earlier), then concurrency controllers by ascending capacity.
//!
//! # Example
//!
//! ```rust
//! use sluice_core::HttpRequest;
//! use sluice_flow::{ControllerConfig, ControllerRegistry, FlowConfig};
//!
//! let config = FlowConfig::default()
//!     .with_controller(ControllerConfig::new("rate").with_rate(100, 60_000))
//!     .with_controller(ControllerConfig::new("global").with_capacity(16));
//! let pipeline = ControllerRegistry::with_builtins()
//!     .build_pipeline(&config)
//!     .unwrap();
//!
//! let mut request = HttpRequest::new().with_service("WMS").with_operation("GetMap");
//! match pipeline.admit(&mut request) {
//!     Ok(guard) => {
//!         // Serve the request, then release every controller.
//!         guard.complete();
//!     }
//!     Err(rejection) => {
//!         let _status = rejection.status_code();
//!     }
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod basic;
pub mod blocker;
pub mod config;
pub mod controller;
pub mod error;
pub mod key;
pub mod keyed;
pub mod matcher;
pub mod pipeline;
pub mod priority;
pub mod rate;
pub mod reclaim;
pub mod registry;

// Re-export main types for convenience.
pub use basic::BasicFlowController;
pub use blocker::{PriorityThreadBlocker, SimpleThreadBlocker, ThreadBlocker};
pub use config::{ControllerConfig, FlowConfig, KeyStrategy, PriorityConfig};
pub use controller::{ControllerStats, FlowController, StatsCounters, Ticket};
pub use error::{FlowError, FlowResult};
pub use key::{CookieKeyGenerator, IpKeyGenerator, KeyGenerator, UserKeyGenerator};
pub use keyed::KeyedFlowController;
pub use matcher::{AnyRequest, OwsRequestMatcher, RequestMatcher, SingleIpMatcher};
pub use pipeline::{timeout_from_millis, AdmissionGuard, FlowPipeline, Rejection, DELAY_HEADER};
pub use priority::{FixedPriority, HttpHeaderPriorityProvider, PriorityProvider};
pub use rate::RateFlowController;
pub use reclaim::{ReclaimPolicy, ReclaimTrigger, Reclaimer};
pub use registry::{BuildContext, ControllerFactory, ControllerRegistry};
