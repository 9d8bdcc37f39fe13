//! Sluice Core - identifiers, the request boundary, and limits for Sluice.
//!
//! This crate holds the values every other Sluice crate agrees on: how a
//! request is identified and inspected, how time is read, and which bounds the
//! flow-control layer enforces. It has no blocking and no policy.
//!
//! # Design Principles
//!
//! - **Strongly-typed IDs**: a `RequestId` is not a `u64`
//! - **Explicit limits**: every per-key map has a reclamation bound
//! - **Time is an input**: controllers read an injected `Clock`
//! - **No unsafe code**

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod clock;
mod error;
mod limits;
mod request;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use limits::{Limits, DEFAULT_COOKIE_NAME, DEFAULT_TIMEOUT_MS, MILLIS_PER_DAY};
pub use request::{Cookie, HttpRequest, Request, ResponseHeaders};
pub use types::{PartitionKey, RequestId};
