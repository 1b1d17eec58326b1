//! StateStore — redb-backed repository for Terraplane.
//!
//! Every persisted entity implements [`Record`], which names its table and
//! key. On top of that the store offers typed CRUD, prefix scans over
//! composite keys, conditional deployment updates, and [`StateStore::write`]
//! for multi-record changes that must commit together or not at all.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use terraplane_core::Template;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// A JSON-valued table.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// A persisted entity: which table it lives in and under which key.
pub trait Record: Serialize + DeserializeOwned {
    const TABLE: JsonTable;

    fn table_key(&self) -> String;
}

impl Record for Deployment {
    const TABLE: JsonTable = DEPLOYMENTS;

    fn table_key(&self) -> String {
        self.id.clone()
    }
}

impl Record for Resource {
    const TABLE: JsonTable = RESOURCES;

    fn table_key(&self) -> String {
        self.id.clone()
    }
}

impl Record for ResourceDependency {
    const TABLE: JsonTable = DEPENDENCIES;

    fn table_key(&self) -> String {
        format!("{}:{}", self.dependent_id, self.dependency_id)
    }
}

impl Record for UniqueConstraint {
    const TABLE: JsonTable = CONSTRAINTS;

    fn table_key(&self) -> String {
        UniqueConstraint::row_key(self.scope, self.scope_id.as_deref(), &self.key, &self.value)
    }
}

impl Record for ProjectResourceQuota {
    const TABLE: JsonTable = QUOTAS;

    fn table_key(&self) -> String {
        self.project_id.clone()
    }
}

impl Record for ProviderConfig {
    const TABLE: JsonTable = PROVIDERS;

    fn table_key(&self) -> String {
        self.id.clone()
    }
}

impl Record for Template {
    const TABLE: JsonTable = TEMPLATES;

    fn table_key(&self) -> String {
        self.id.clone()
    }
}

impl Record for SecretRecord {
    const TABLE: JsonTable = SECRETS;

    fn table_key(&self) -> String {
        self.id.clone()
    }
}

impl Record for QueueMessage {
    const TABLE: JsonTable = QUEUE;

    fn table_key(&self) -> String {
        self.row_key()
    }
}

impl Record for LogLine {
    const TABLE: JsonTable = LOGS;

    fn table_key(&self) -> String {
        self.row_key()
    }
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn get_from<T, Tbl>(table: &Tbl, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    Tbl: ReadableTable<&'static str, &'static [u8]>,
{
    let value = match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Some(decode(guard.value())?),
        None => None,
    };
    Ok(value)
}

fn scan_prefix<T, Tbl>(table: &Tbl, prefix: &str) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    Tbl: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            results.push(decode(value.value())?);
        }
    }
    Ok(results)
}

fn first_with_prefix<T, Tbl>(table: &Tbl, prefix: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    Tbl: ReadableTable<&'static str, &'static [u8]>,
{
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            return Ok(Some(decode(value.value())?));
        }
    }
    Ok(None)
}

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
        for table in [
            DEPLOYMENTS,
            RESOURCES,
            DEPENDENCIES,
            DEPENDENTS,
            CONSTRAINTS,
            QUOTAS,
            PROVIDERS,
            TEMPLATES,
            SECRETS,
            QUEUE,
            LOGS,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run `f` inside one write transaction. Everything `f` wrote is
    /// committed if it returns `Ok` and discarded otherwise.
    pub fn write<R, E>(&self, f: impl FnOnce(&StateTxn<'_>) -> Result<R, E>) -> Result<R, E>
    where
        E: From<StateError>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        match f(&StateTxn { txn: &txn }) {
            Ok(value) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = txn.abort() {
                    debug!(error = %abort_err, "transaction abort failed");
                }
                Err(e)
            }
        }
    }

    // ── Generic records ────────────────────────────────────────────

    pub fn get<T: Record>(&self, key: &str) -> StateResult<Option<T>> {
        self.get_in(T::TABLE, key)
    }

    pub fn get_in<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        get_from(&table, key)
    }

    /// Insert or update a record.
    pub fn put<T: Record>(&self, record: &T) -> StateResult<()> {
        self.write(|txn| txn.put(record))
    }

    /// Delete a record by key. Returns true if it existed.
    pub fn delete<T: Record>(&self, key: &str) -> StateResult<bool> {
        self.write(|txn| txn.delete::<T>(key))
    }

    pub fn list<T: Record>(&self) -> StateResult<Vec<T>> {
        self.list_prefix("")
    }

    /// All records whose key starts with `prefix`, in key order.
    pub fn list_prefix<T: Record>(&self, prefix: &str) -> StateResult<Vec<T>> {
        self.list_prefix_in(T::TABLE, prefix)
    }

    pub fn list_prefix_in<T: DeserializeOwned>(
        &self,
        def: JsonTable,
        prefix: &str,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        scan_prefix(&table, prefix)
    }

    pub fn first_prefix<T: Record>(&self, prefix: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(T::TABLE).map_err(map_err!(Table))?;
        first_with_prefix(&table, prefix)
    }

    // ── Deployments ────────────────────────────────────────────────

    pub fn get_deployment(&self, id: &str) -> StateResult<Option<Deployment>> {
        self.get(id)
    }

    pub fn list_deployments(&self, project_id: &str) -> StateResult<Vec<Deployment>> {
        Ok(self
            .list::<Deployment>()?
            .into_iter()
            .filter(|d| d.project_id == project_id)
            .collect())
    }

    /// Conditional update: apply `f` only if the deployment is still in one
    /// of `expected`. `None` means zero rows were affected.
    pub fn transition_deployment(
        &self,
        id: &str,
        expected: &[DeploymentStatus],
        f: impl FnOnce(&mut Deployment),
    ) -> StateResult<Option<Deployment>> {
        self.write(|txn| txn.transition_deployment(id, expected, f))
    }

    // ── Resources ──────────────────────────────────────────────────

    pub fn list_resources(&self, project_id: &str) -> StateResult<Vec<Resource>> {
        Ok(self
            .list::<Resource>()?
            .into_iter()
            .filter(|r| r.project_id == project_id)
            .collect())
    }

    pub fn resources_for_deployment(&self, deployment_id: &str) -> StateResult<Vec<Resource>> {
        Ok(self
            .list::<Resource>()?
            .into_iter()
            .filter(|r| r.deployment_id == deployment_id)
            .collect())
    }
}

/// Handle to an open write transaction, see [`StateStore::write`].
pub struct StateTxn<'a> {
    txn: &'a WriteTransaction,
}

impl StateTxn<'_> {
    pub fn get<T: Record>(&self, key: &str) -> StateResult<Option<T>> {
        self.get_in(T::TABLE, key)
    }

    pub fn get_in<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let table = self.txn.open_table(def).map_err(map_err!(Table))?;
        get_from(&table, key)
    }

    pub fn put<T: Record>(&self, record: &T) -> StateResult<()> {
        self.put_in(T::TABLE, &record.table_key(), record)
    }

    pub fn put_in<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = encode(value)?;
        let mut table = self.txn.open_table(def).map_err(map_err!(Table))?;
        table
            .insert(key, bytes.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    pub fn delete<T: Record>(&self, key: &str) -> StateResult<bool> {
        self.delete_in(T::TABLE, key)
    }

    pub fn delete_in(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let mut table = self.txn.open_table(def).map_err(map_err!(Table))?;
        let existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        Ok(existed)
    }

    pub fn list<T: Record>(&self) -> StateResult<Vec<T>> {
        self.list_prefix("")
    }

    pub fn list_prefix<T: Record>(&self, prefix: &str) -> StateResult<Vec<T>> {
        self.list_prefix_in(T::TABLE, prefix)
    }

    pub fn list_prefix_in<T: DeserializeOwned>(
        &self,
        def: JsonTable,
        prefix: &str,
    ) -> StateResult<Vec<T>> {
        let table = self.txn.open_table(def).map_err(map_err!(Table))?;
        scan_prefix(&table, prefix)
    }

    /// Next value of the named monotonic counter (starts at 1).
    pub fn next_sequence(&self, name: &str) -> StateResult<u64> {
        let mut table = self.txn.open_table(META).map_err(map_err!(Table))?;
        let current = table
            .get(name)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        let next = current + 1;
        table.insert(name, next).map_err(map_err!(Write))?;
        Ok(next)
    }

    /// Transactional form of [`StateStore::transition_deployment`].
    pub fn transition_deployment(
        &self,
        id: &str,
        expected: &[DeploymentStatus],
        f: impl FnOnce(&mut Deployment),
    ) -> StateResult<Option<Deployment>> {
        let Some(mut deployment) = self.get::<Deployment>(id)? else {
            return Ok(None);
        };
        if !expected.contains(&deployment.status) {
            debug!(
                deployment_id = %id,
                status = %deployment.status,
                "conditional update skipped"
            );
            return Ok(None);
        }
        f(&mut deployment);
        deployment.updated_at = epoch_secs();
        self.put(&deployment)?;
        Ok(Some(deployment))
    }
}
