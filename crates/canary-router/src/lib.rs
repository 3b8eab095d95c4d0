//! canary-router — traffic router adapter for canary releases.
//!
//! The controller hands this crate a weight per service and nothing else.
//! How those weights reach the reverse proxy is the adapter's business.
//!
//! # Components
//!
//! - **`split`** — `TrafficSplit` and the `WeightMap` data contract
//! - **`router`** — `TrafficRouter` trait and the in-memory `MemoryRouter`
//! - **`nginx`** — `NginxRouter`, renders upstream blocks and publishes them atomically

pub mod error;
pub mod nginx;
pub mod router;
pub mod split;

pub use error::{RouterError, RouterResult};
pub use nginx::{NginxRouter, UpstreamAddrs};
pub use router::{MemoryRouter, TrafficRouter};
pub use split::{TrafficSplit, WeightMap};
