//! redb table definitions for the release store.
//!
//! Keys are `&str`; release and rollout values are JSON-serialized domain
//! types, stable tags are stored as plain strings.

use redb::TableDefinition;

/// Promoted stable tag keyed by `{service}`.
pub const STABLE_TAGS: TableDefinition<&str, &str> = TableDefinition::new("stable_tags");

/// Current `ServiceRelease` keyed by `{service}`.
pub const RELEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("releases");

/// Sealed `RolloutRecord`s keyed by `{service}:{started_at_ms:020}:{id}`.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");
