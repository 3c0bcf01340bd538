use super::records::{RecordStore, RecordUpdate};
use crate::error::StoreError;
use crate::types::{DeploymentName, DeploymentRecord, ObjectIdentifier, RecordKey};
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;

const RECORDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("records");
const RECORDS_BY_OBJECT_TABLE: TableDefinition<&str, &str> =
    TableDefinition::new("records_by_object");

const KEY_SEPARATOR: char = '\0';
// Sorts directly after KEY_SEPARATOR, used as the exclusive end of prefix scans
const PREFIX_END: char = '\u{1}';

fn record_key(key: &RecordKey) -> String {
    format!(
        "{}{KEY_SEPARATOR}{:020}",
        key.deployment_name, key.deploy_time
    )
}

fn object_index_key(object: &ObjectIdentifier, key: &RecordKey) -> String {
    format!(
        "{object}{KEY_SEPARATOR}{}{KEY_SEPARATOR}{:020}",
        key.deployment_name, key.deploy_time
    )
}

fn prefix_range(prefix: String) -> (String, String) {
    (
        format!("{prefix}{KEY_SEPARATOR}"),
        format!("{prefix}{PREFIX_END}"),
    )
}

/// Deployment record store backed by a local redb file.
///
/// Records live in `records` keyed by `(deployment_name, deploy_time)`, with
/// the zero-padded time keeping each deployment's rows in time order. The
/// `records_by_object` table is the secondary index on
/// `(object_identifier, deployment_name)`.
///
/// The async trait methods run each redb transaction on tokio's blocking
/// pool. Write transactions are serialized by redb.
pub struct RedbRecordStore {
    db: Arc<Database>,
}

impl RedbRecordStore {
    pub fn new(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("Failed to create record store directory: {}", e))
            })?;
        }

        let db = Database::create(&path)?;

        let write_txn = db.begin_write()?;
        {
            let _records = write_txn.open_table(RECORDS_TABLE)?;
            let _by_object = write_txn.open_table(RECORDS_BY_OBJECT_TABLE)?;
        }
        write_txn.commit()?;

        tracing::debug!("Opened deployment record store at {}", path.display());
        Ok(Self { db: Arc::new(db) })
    }

    /// Blocking point read, for callers outside the async runtime
    pub fn get_record(&self, key: &RecordKey) -> Result<Option<DeploymentRecord>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RECORDS_TABLE)?;

        match table.get(record_key(key).as_str())? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    async fn run_blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|e| StoreError::Backend(format!("Record store task failed: {}", e)))?
    }
}

fn write_record(db: &Database, record: &DeploymentRecord) -> Result<(), StoreError> {
    let key = record.key();
    let primary = record_key(&key);
    let value = serde_json::to_vec(record)?;

    let write_txn = db.begin_write()?;
    {
        let mut table = write_txn.open_table(RECORDS_TABLE)?;
        let mut index = write_txn.open_table(RECORDS_BY_OBJECT_TABLE)?;

        let previous = table
            .insert(primary.as_str(), value.as_slice())?
            .map(|guard| guard.value().to_vec());
        if let Some(previous) = previous {
            let previous: DeploymentRecord = serde_json::from_slice(&previous)?;
            index.remove(object_index_key(&previous.object_identifier, &key).as_str())?;
        }
        index.insert(
            object_index_key(&record.object_identifier, &key).as_str(),
            primary.as_str(),
        )?;
    }
    write_txn.commit()?;
    Ok(())
}

fn read_by_object(
    db: &Database,
    object: &ObjectIdentifier,
    deployment: &DeploymentName,
) -> Result<Vec<DeploymentRecord>, StoreError> {
    let read_txn = db.begin_read()?;
    let index = read_txn.open_table(RECORDS_BY_OBJECT_TABLE)?;
    let table = read_txn.open_table(RECORDS_TABLE)?;

    let (start, end) = prefix_range(format!("{object}{KEY_SEPARATOR}{deployment}"));
    let mut records = Vec::new();
    for item in index.range(start.as_str()..end.as_str())? {
        let (_index_key, primary) = item?;
        if let Some(value) = table.get(primary.value())? {
            records.push(serde_json::from_slice(value.value())?);
        }
    }
    Ok(records)
}

fn scan_deployment(
    db: &Database,
    deployment: &DeploymentName,
    newest_first: bool,
    limit: Option<usize>,
) -> Result<Vec<DeploymentRecord>, StoreError> {
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(RECORDS_TABLE)?;

    let (start, end) = prefix_range(deployment.to_string());
    let range = table.range(start.as_str()..end.as_str())?;
    let limit = limit.unwrap_or(usize::MAX);

    let mut records = Vec::new();
    if newest_first {
        for item in range.rev().take(limit) {
            let (_key, value) = item?;
            records.push(serde_json::from_slice(value.value())?);
        }
    } else {
        for item in range.take(limit) {
            let (_key, value) = item?;
            records.push(serde_json::from_slice(value.value())?);
        }
    }
    Ok(records)
}

fn apply_update(db: &Database, key: &RecordKey, update: &RecordUpdate) -> Result<(), StoreError> {
    let primary = record_key(key);

    let write_txn = db.begin_write()?;
    {
        let mut table = write_txn.open_table(RECORDS_TABLE)?;
        let existing = table
            .get(primary.as_str())?
            .map(|guard| guard.value().to_vec())
            .ok_or_else(|| StoreError::RecordNotFound(key.clone()))?;

        let mut record: DeploymentRecord = serde_json::from_slice(&existing)?;
        update.apply(&mut record);
        let value = serde_json::to_vec(&record)?;
        table.insert(primary.as_str(), value.as_slice())?;
    }
    write_txn.commit()?;
    Ok(())
}

#[async_trait]
impl RecordStore for RedbRecordStore {
    async fn put_record(&self, record: &DeploymentRecord) -> Result<(), StoreError> {
        let owned = record.clone();
        self.run_blocking(move |db| write_record(db, &owned)).await?;

        tracing::debug!("Stored deployment record {}", record.key());
        Ok(())
    }

    async fn query_by_object(
        &self,
        object: &ObjectIdentifier,
        deployment: &DeploymentName,
    ) -> Result<Vec<DeploymentRecord>, StoreError> {
        let object = object.clone();
        let deployment = deployment.clone();
        self.run_blocking(move |db| read_by_object(db, &object, &deployment))
            .await
    }

    async fn latest_records(
        &self,
        deployment: &DeploymentName,
        limit: usize,
    ) -> Result<Vec<DeploymentRecord>, StoreError> {
        // Reads observe every committed write transaction
        let deployment = deployment.clone();
        self.run_blocking(move |db| scan_deployment(db, &deployment, true, Some(limit)))
            .await
    }

    async fn update_record(
        &self,
        key: &RecordKey,
        update: RecordUpdate,
    ) -> Result<(), StoreError> {
        let key = key.clone();
        self.run_blocking(move |db| apply_update(db, &key, &update))
            .await
    }

    async fn query_by_deployment(
        &self,
        deployment: &DeploymentName,
    ) -> Result<Vec<DeploymentRecord>, StoreError> {
        let deployment = deployment.clone();
        self.run_blocking(move |db| scan_deployment(db, &deployment, false, None))
            .await
    }
}
