//! Lazily-loaded, dirty-tracked view over one agent's persisted state.
//!
//! Nothing touches the store until the first read or write. Writes and
//! deletes stay in memory until [`StateProxy::flush`], which the executor
//! calls once when a run finishes.
//!
//! Two proxies for the same agent (two concurrent runs) hold independent
//! copies; whichever flushes last wins.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{StateError, StoreError};
use crate::store::Store;

pub struct StateProxy {
    store: Arc<dyn Store>,
    agent: String,
    data: Option<HashMap<String, Value>>,
    dirty: HashMap<String, Value>,
    deleted: HashSet<String>,
}

impl StateProxy {
    pub fn new(store: Arc<dyn Store>, agent: impl Into<String>) -> Self {
        Self {
            store,
            agent: agent.into(),
            data: None,
            dirty: HashMap::new(),
            deleted: HashSet::new(),
        }
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Whether the backing data has been fetched yet.
    pub fn is_loaded(&self) -> bool {
        self.data.is_some()
    }

    async fn load(&mut self) -> Result<&mut HashMap<String, Value>, StoreError> {
        if self.data.is_none() {
            let state = self.store.get_state(&self.agent).await?;
            self.data = Some(state);
        }
        Ok(self.data.get_or_insert_with(HashMap::new))
    }

    /// Value for `key`, or `MissingKey`.
    pub async fn get(&mut self, key: &str) -> Result<Value, StateError> {
        self.load()
            .await?
            .get(key)
            .cloned()
            .ok_or_else(|| StateError::MissingKey(key.to_string()))
    }

    pub async fn get_opt(&mut self, key: &str) -> Result<Option<Value>, StateError> {
        Ok(self.load().await?.get(key).cloned())
    }

    /// Typed read. `None` when the key is absent.
    pub async fn get_as<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>, StateError> {
        match self.get_opt(key).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| StateError::Decode {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub async fn contains_key(&mut self, key: &str) -> Result<bool, StateError> {
        Ok(self.load().await?.contains_key(key))
    }

    pub async fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), StateError> {
        let key = key.into();
        let value = value.into();
        self.load().await?.insert(key.clone(), value.clone());
        self.dirty.insert(key, value);
        Ok(())
    }

    /// Remove `key`, returning its value. Cancels any pending write of it.
    pub async fn delete(&mut self, key: &str) -> Result<Value, StateError> {
        let value = self
            .load()
            .await?
            .remove(key)
            .ok_or_else(|| StateError::MissingKey(key.to_string()))?;
        self.deleted.insert(key.to_string());
        self.dirty.remove(key);
        Ok(value)
    }

    /// Keys in sorted order.
    pub async fn keys(&mut self) -> Result<Vec<String>, StateError> {
        let mut keys: Vec<_> = self.load().await?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    /// All entries, sorted by key.
    pub async fn entries(&mut self) -> Result<Vec<(String, Value)>, StateError> {
        let mut entries: Vec<_> = self
            .load()
            .await?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    pub async fn len(&mut self) -> Result<usize, StateError> {
        Ok(self.load().await?.len())
    }

    pub async fn is_empty(&mut self) -> Result<bool, StateError> {
        Ok(self.load().await?.is_empty())
    }

    /// Push pending changes to the store: deletions first, then upserts.
    ///
    /// A no-op when the data was never loaded.
    pub async fn flush(&mut self) -> Result<(), StoreError> {
        if self.data.is_none() {
            return Ok(());
        }
        if !self.deleted.is_empty() {
            self.store
                .delete_state_keys(&self.agent, &self.deleted)
                .await?;
            self.deleted.clear();
        }
        if !self.dirty.is_empty() {
            self.store.set_state_bulk(&self.agent, &self.dirty).await?;
            self.dirty.clear();
        }
        Ok(())
    }
}

impl std::fmt::Debug for StateProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateProxy")
            .field("agent", &self.agent)
            .field("loaded", &self.data.is_some())
            .field("dirty", &self.dirty.len())
            .field("deleted", &self.deleted.len())
            .finish()
    }
}
