//! canary-instances — instance group management for canary releases.
//!
//! Each service has at most two groups, `stable` and `canary`. The
//! controller only ever issues commands through the
//! [`InstanceGroupManager`] trait; it never touches instances itself.
//!
//! # Backends
//!
//! - **`LocalGroupManager`** — in-process bookkeeping, for dry runs and tests
//! - **`DockerGroupManager`** — drives the Docker CLI, one container per replica
//!
//! `ensure` is idempotent and replaces replicas one at a time. A failed
//! `ensure` never touches the opposite role.

pub mod docker;
pub mod error;
pub mod manager;

pub use docker::{DockerConfig, DockerGroupManager};
pub use error::{InstanceError, InstanceResult};
pub use manager::{InstanceGroupManager, LocalGroupManager};
