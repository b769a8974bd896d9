//! Typed CDC operations over a [`CoordStore`].

use std::sync::Arc;

use tokio::sync::mpsc;

use drift_model::{ChangeFeedStatus, TaskPosition, TaskStatus, TaskWorkload};

use crate::error::StoreError;
use crate::keys;
use crate::store::{CoordStore, WatchEvent};

/// Client for the per-changefeed, per-capture keys the processor owns plus
/// the owner-published changefeed status.
#[derive(Clone)]
pub struct CoordClient {
    store: Arc<dyn CoordStore>,
}

impl CoordClient {
    pub fn new(store: Arc<dyn CoordStore>) -> Self {
        Self { store }
    }

    /// Access to the raw store, for watches anchored at arbitrary revisions.
    pub fn store(&self) -> &Arc<dyn CoordStore> {
        &self.store
    }

    /// Fetch this capture's task status. An absent key maps to the default
    /// status at revision 0, so a fresh capture can CAS-create it.
    pub async fn get_task_status(
        &self,
        changefeed_id: &str,
        capture_id: &str,
    ) -> Result<(i64, TaskStatus), StoreError> {
        let key = keys::task_status_key(changefeed_id, capture_id);
        match self.store.get(&key).await? {
            Some(kv) => Ok((kv.mod_revision, serde_json::from_slice(&kv.value)?)),
            None => Ok((0, TaskStatus::default())),
        }
    }

    /// CAS-write the task status, guarded by the revision observed at read
    /// time. Surfaces [`StoreError::Conflict`] for the caller's retry loop.
    pub async fn put_task_status(
        &self,
        changefeed_id: &str,
        capture_id: &str,
        status: &TaskStatus,
        expected_mod_revision: i64,
    ) -> Result<i64, StoreError> {
        let key = keys::task_status_key(changefeed_id, capture_id);
        let value = serde_json::to_vec(status)?;
        self.store.cas(&key, value, expected_mod_revision).await
    }

    pub async fn get_task_position(
        &self,
        changefeed_id: &str,
        capture_id: &str,
    ) -> Result<Option<TaskPosition>, StoreError> {
        let key = keys::task_position_key(changefeed_id, capture_id);
        match self.store.get(&key).await? {
            Some(kv) => Ok(Some(serde_json::from_slice(&kv.value)?)),
            None => Ok(None),
        }
    }

    /// Write the task position only when its serialized form changed.
    /// Returns whether a write happened.
    pub async fn put_task_position_on_change(
        &self,
        changefeed_id: &str,
        capture_id: &str,
        position: &TaskPosition,
    ) -> Result<bool, StoreError> {
        let key = keys::task_position_key(changefeed_id, capture_id);
        let value = serde_json::to_vec(position)?;
        if let Some(kv) = self.store.get(&key).await? {
            if kv.value == value {
                return Ok(false);
            }
        }
        self.store.put(&key, value).await?;
        Ok(true)
    }

    /// Read the owner-published changefeed status together with its
    /// modification revision (the anchor for the follow-up watch).
    pub async fn get_changefeed_status(
        &self,
        changefeed_id: &str,
    ) -> Result<(ChangeFeedStatus, i64), StoreError> {
        let key = keys::job_key(changefeed_id);
        match self.store.get(&key).await? {
            Some(kv) => Ok((serde_json::from_slice(&kv.value)?, kv.mod_revision)),
            None => Err(StoreError::NotFound(key)),
        }
    }

    /// Watch the changefeed status key from `from_revision`.
    pub async fn watch_changefeed_status(
        &self,
        changefeed_id: &str,
        from_revision: i64,
    ) -> Result<mpsc::UnboundedReceiver<WatchEvent>, StoreError> {
        let key = keys::job_key(changefeed_id);
        self.store.watch(&key, from_revision).await
    }

    pub async fn put_task_workload(
        &self,
        changefeed_id: &str,
        capture_id: &str,
        workload: &TaskWorkload,
    ) -> Result<(), StoreError> {
        let key = keys::task_workload_key(changefeed_id, capture_id);
        let value = serde_json::to_vec(workload)?;
        self.store.put(&key, value).await?;
        Ok(())
    }

    /// Remove the three task keys this capture owns. Called on stop; the
    /// sink is closed after this.
    pub async fn delete_task_keys(
        &self,
        changefeed_id: &str,
        capture_id: &str,
    ) -> Result<(), StoreError> {
        self.store
            .delete(&keys::task_position_key(changefeed_id, capture_id))
            .await?;
        self.store
            .delete(&keys::task_status_key(changefeed_id, capture_id))
            .await?;
        self.store
            .delete(&keys::task_workload_key(changefeed_id, capture_id))
            .await?;
        Ok(())
    }

    /// Owner-side helper: publish the changefeed-wide watermarks.
    pub async fn put_changefeed_status(
        &self,
        changefeed_id: &str,
        status: &ChangeFeedStatus,
    ) -> Result<i64, StoreError> {
        let key = keys::job_key(changefeed_id);
        self.store.put(&key, serde_json::to_vec(status)?).await
    }
}
