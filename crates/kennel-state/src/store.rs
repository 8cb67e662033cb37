//! StateStore — redb-backed state persistence for Kennel.
//!
//! Provides typed operations over task and instance records, named sets,
//! and string scalars. Records are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Value stored for set members.
const EMPTY: &[u8] = &[];

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(TASKS).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(SETS).map_err(map_err!(Table))?;
        txn.open_table(SCALARS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Insert or replace a task record.
    pub fn put_task(&self, task: &TaskRecord) -> StateResult<()> {
        self.put_record(TASKS, &task.task_id.to_string(), task)?;
        debug!(task_id = %task.task_id, status = %task.status, "task stored");
        Ok(())
    }

    /// Get a task by id.
    pub fn get_task(&self, task_id: &TaskId) -> StateResult<Option<TaskRecord>> {
        self.get_record(TASKS, &task_id.to_string())
    }

    /// Merge changes into an existing task record in one transaction.
    ///
    /// Returns the updated record, or `None` if the task is unknown.
    pub fn update_task<F>(&self, task_id: &TaskId, f: F) -> StateResult<Option<TaskRecord>>
    where
        F: FnOnce(&mut TaskRecord),
    {
        self.update_record(TASKS, &task_id.to_string(), |task: &mut TaskRecord| {
            f(task);
            task.clone()
        })
    }

    /// List all task records.
    pub fn list_tasks(&self) -> StateResult<Vec<TaskRecord>> {
        self.list_records(TASKS)
    }

    /// Task records for every member of the active task set.
    ///
    /// Members without a record are skipped.
    pub fn active_tasks(&self) -> StateResult<Vec<TaskRecord>> {
        let mut tasks = Vec::new();
        for task_id in self.active_task_ids()? {
            match self.get_task(&task_id)? {
                Some(task) => tasks.push(task),
                None => warn!(%task_id, "active task has no record"),
            }
        }
        Ok(tasks)
    }

    // ── Active task set ────────────────────────────────────────────

    /// Add a task to the active set. Returns true if it was not a member.
    pub fn register_active_task(&self, task_id: &TaskId) -> StateResult<bool> {
        self.set_add(ACTIVE_TASKS, &task_id.to_string())
    }

    /// Remove a task from the active set. Returns true if it was a member.
    pub fn deregister_active_task(&self, task_id: &TaskId) -> StateResult<bool> {
        self.set_remove(ACTIVE_TASKS, &task_id.to_string())
    }

    /// Whether a task is still in the active set.
    pub fn is_active_task(&self, task_id: &str) -> StateResult<bool> {
        self.set_contains(ACTIVE_TASKS, task_id)
    }

    /// Ids of all active tasks.
    pub fn active_task_ids(&self) -> StateResult<Vec<TaskId>> {
        let members = self.set_members(ACTIVE_TASKS)?;
        Ok(members
            .iter()
            .filter_map(|m| match m.parse::<TaskId>() {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(member = %m, error = %e, "ignoring malformed active task id");
                    None
                }
            })
            .collect())
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or replace an instance record.
    pub fn put_instance(&self, instance: &InstanceRecord) -> StateResult<()> {
        self.put_record(INSTANCES, &instance.instance_id, instance)
    }

    /// Get an instance by id.
    pub fn get_instance(&self, instance_id: &str) -> StateResult<Option<InstanceRecord>> {
        self.get_record(INSTANCES, instance_id)
    }

    /// Merge changes into an existing instance record in one transaction.
    pub fn update_instance<F>(
        &self,
        instance_id: &str,
        f: F,
    ) -> StateResult<Option<InstanceRecord>>
    where
        F: FnOnce(&mut InstanceRecord),
    {
        self.update_record(INSTANCES, instance_id, |rec: &mut InstanceRecord| {
            f(rec);
            rec.clone()
        })
    }

    /// Merge changes into an instance record, creating it if absent.
    ///
    /// Returns the resulting record and whether it was newly created.
    pub fn upsert_instance<F>(
        &self,
        instance_id: &str,
        created_at: u64,
        f: F,
    ) -> StateResult<(InstanceRecord, bool)>
    where
        F: FnOnce(&mut InstanceRecord),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let existing: Option<InstanceRecord> = match table
                .get(instance_id)
                .map_err(map_err!(Read))?
            {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            let created = existing.is_none();
            let mut rec = existing.unwrap_or_else(|| InstanceRecord {
                instance_id: instance_id.to_string(),
                created_at,
                ..InstanceRecord::default()
            });
            f(&mut rec);
            let value = serde_json::to_vec(&rec).map_err(map_err!(Serialize))?;
            table
                .insert(instance_id, value.as_slice())
                .map_err(map_err!(Write))?;
            result = (rec, created);
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }

    /// List all instance records.
    pub fn list_instances(&self) -> StateResult<Vec<InstanceRecord>> {
        self.list_records(INSTANCES)
    }

    /// Record a freshly launched instance and mark it pending, atomically.
    pub fn register_pending_instance(&self, instance: &InstanceRecord) -> StateResult<()> {
        let value = serde_json::to_vec(instance).map_err(map_err!(Serialize))?;
        let member = set_key(PENDING_INSTANCES, &instance.instance_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            instances
                .insert(instance.instance_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            let mut sets = txn.open_table(SETS).map_err(map_err!(Table))?;
            sets.insert(member.as_str(), EMPTY)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(instance_id = %instance.instance_id, earmark = ?instance.earmark, "instance registered as pending");
        Ok(())
    }

    /// Start an idle episode unless one is already running.
    ///
    /// Read and write happen in a single transaction. Returns true if
    /// `idle_since` was set by this call.
    pub fn set_idle_since_if_absent(&self, instance_id: &str, since: u64) -> StateResult<bool> {
        let changed = self.update_record(INSTANCES, instance_id, |rec: &mut InstanceRecord| {
            if rec.idle_since.is_none() {
                rec.idle_since = Some(since);
                true
            } else {
                false
            }
        })?;
        Ok(changed.unwrap_or(false))
    }

    /// End the current idle episode. Returns true if one was running.
    pub fn clear_idle_since(&self, instance_id: &str) -> StateResult<bool> {
        let changed = self.update_record(INSTANCES, instance_id, |rec: &mut InstanceRecord| {
            rec.idle_since.take().is_some()
        })?;
        Ok(changed.unwrap_or(false))
    }

    // ── Pending instance set ───────────────────────────────────────

    /// Remove an instance from the pending set. Returns true if it was a member.
    pub fn clear_pending_instance(&self, instance_id: &str) -> StateResult<bool> {
        self.set_remove(PENDING_INSTANCES, instance_id)
    }

    /// Ids of all pending instances.
    pub fn pending_instances(&self) -> StateResult<Vec<InstanceId>> {
        self.set_members(PENDING_INSTANCES)
    }

    // ── Sets ───────────────────────────────────────────────────────

    /// Add a member to a named set. Returns true if it was not already present.
    pub fn set_add(&self, set: &str, member: &str) -> StateResult<bool> {
        let key = set_key(set, member);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let added;
        {
            let mut table = txn.open_table(SETS).map_err(map_err!(Table))?;
            added = table
                .insert(key.as_str(), EMPTY)
                .map_err(map_err!(Write))?
                .is_none();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%set, %member, added, "set member added");
        Ok(added)
    }

    /// Remove a member from a named set. Removing an absent member is a no-op.
    pub fn set_remove(&self, set: &str, member: &str) -> StateResult<bool> {
        let key = set_key(set, member);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(SETS).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%set, %member, existed, "set member removed");
        Ok(existed)
    }

    /// Whether a member belongs to a named set.
    pub fn set_contains(&self, set: &str, member: &str) -> StateResult<bool> {
        let key = set_key(set, member);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SETS).map_err(map_err!(Table))?;
        Ok(table.get(key.as_str()).map_err(map_err!(Read))?.is_some())
    }

    /// All members of a named set.
    pub fn set_members(&self, set: &str) -> StateResult<Vec<String>> {
        let prefix = format!("{set}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SETS).map_err(map_err!(Table))?;
        let mut members = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if let Some(member) = key.value().strip_prefix(&prefix) {
                members.push(member.to_string());
            }
        }
        Ok(members)
    }

    // ── Scalars ────────────────────────────────────────────────────

    /// Get a scalar value.
    pub fn get_scalar(&self, key: &str) -> StateResult<Option<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SCALARS).map_err(map_err!(Table))?;
        Ok(table
            .get(key)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_string()))
    }

    /// Set a scalar value.
    pub fn set_scalar(&self, key: &str, value: &str) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SCALARS).map_err(map_err!(Table))?;
            table.insert(key, value).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Delete a scalar. Returns true if it existed.
    pub fn delete_scalar(&self, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(SCALARS).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Timestamp of the last launch batch, if any.
    pub fn launch_timeout(&self) -> StateResult<Option<u64>> {
        match self.get_scalar(LAUNCH_TIMEOUT)? {
            Some(value) => value
                .parse::<u64>()
                .map(Some)
                .map_err(|_| StateError::CorruptScalar {
                    key: LAUNCH_TIMEOUT.to_string(),
                    value,
                }),
            None => Ok(None),
        }
    }

    /// Record the start of a launch batch.
    pub fn set_launch_timeout(&self, at: u64) -> StateResult<()> {
        debug!(at, "launch timeout marker set");
        self.set_scalar(LAUNCH_TIMEOUT, &at.to_string())
    }

    /// Forget the launch-timeout marker.
    pub fn clear_launch_timeout(&self) -> StateResult<bool> {
        self.delete_scalar(LAUNCH_TIMEOUT)
    }

    /// Map a cluster arn (task or container instance) to its local id.
    pub fn map_arn(&self, arn: &str, id: &str) -> StateResult<()> {
        self.set_scalar(&arn_key(arn), id)?;
        debug!(%arn, %id, "arn mapped");
        Ok(())
    }

    /// Reverse lookup of a cluster arn.
    pub fn id_for_arn(&self, arn: &str) -> StateResult<Option<String>> {
        self.get_scalar(&arn_key(arn))
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn put_record<T: Serialize>(&self, def: RecordTable, key: &str, record: &T) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_record<T: DeserializeOwned>(&self, def: RecordTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn list_records<T: DeserializeOwned>(&self, def: RecordTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Read-modify-write a record inside one write transaction.
    ///
    /// Returns `None` (and writes nothing) when the key is absent.
    fn update_record<T, R, F>(&self, def: RecordTable, key: &str, f: F) -> StateResult<Option<R>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> R,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let current: Option<T> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            result = match current {
                Some(mut record) => {
                    let out = f(&mut record);
                    let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                    table
                        .insert(key, value.as_slice())
                        .map_err(map_err!(Write))?;
                    Some(out)
                }
                None => None,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }
}

fn set_key(set: &str, member: &str) -> String {
    format!("{set}:{member}")
}

fn arn_key(arn: &str) -> String {
    format!("arn:{arn}")
}
