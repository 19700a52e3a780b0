//! Signed HTTP request primitive and a bounded, priority-aware worker pool.
//!
//! This crate is the bottom two layers of the mounted filesystem: [`Request`]
//! (one authenticated HTTP call) and [`Pool`] (the fixed set of worker
//! threads that run requests on behalf of higher layers). Nothing here knows
//! about objects, buckets, or directories — those live in `s3fs-core`, which
//! depends on this crate the same way a cache depends on the thing it caches
//! requests to.

mod handle;
mod pool;
mod queue;
pub mod request;
mod single_flight;
pub mod signing;

pub use handle::AsyncHandle;
pub use pool::{Pool, PoolConfig, Priority, WorkFn};
pub use request::{HmacSigner, OutputMode, Request, RequestError, Signer, TimeoutState};
pub use single_flight::{Attach, SingleFlight};
