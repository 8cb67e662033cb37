//! redb table definitions for the Kennel state store.

use redb::TableDefinition;

/// Task records keyed by task id.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Instance records keyed by compute instance id.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Set membership keyed by `{set}:{member}`. Values are unused.
pub const SETS: TableDefinition<&str, &[u8]> = TableDefinition::new("sets");

/// Plain string scalars (launch-timeout marker, `arn:{arn}` lookups).
pub const SCALARS: TableDefinition<&str, &str> = TableDefinition::new("scalars");
