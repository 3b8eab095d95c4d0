//! canary-state — release state for the canary controller.
//!
//! Backed by [redb](https://docs.rs/redb). Holds the one durable fact the
//! controller cannot lose (the promoted stable tag per service) plus the
//! current `ServiceRelease` record and the append-only rollout history.
//!
//! # Architecture
//!
//! The controller talks to the [`ReleaseStore`] trait; [`StateStore`] is the
//! redb implementation. Every write commits its own transaction, so a write
//! that returns `Ok` has reached disk.
//!
//! `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{ReleaseStore, StateStore, DEFAULT_STABLE_TAG};
pub use types::*;
