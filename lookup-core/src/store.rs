use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{CaptureError, CaptureResult};

pub type RecordMap = Map<String, Value>;

/// Merge a fresh capture into previously persisted records.
///
/// A fresh record replaces the persisted one with the same key; keys only
/// present in `existing` are kept.
pub fn merge_records(mut existing: RecordMap, fresh: RecordMap) -> RecordMap {
    for (key, value) in fresh {
        existing.insert(key, value);
    }
    existing
}

/// JSON collections persisted under one profile directory
/// (`tweets.json`, `followers.json`, `api_data.json` ...).
#[derive(Debug)]
pub struct RecordStore {
    dir: PathBuf,
    enabled: bool,
    write_lock: Mutex<()>,
}

impl RecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            enabled: true,
            write_lock: Mutex::new(()),
        }
    }

    /// A store that keeps nothing on disk. Used in screenshot-only mode.
    pub fn disabled(dir: impl Into<PathBuf>) -> Self {
        Self {
            enabled: false,
            ..Self::new(dir)
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Records persisted under `name`, or an empty map when there are none.
    pub async fn load(&self, name: &str) -> RecordMap {
        let path = self.path(name);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(_) => return RecordMap::new(),
        };
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                warn!(path = %path.display(), "ignoring unreadable record collection");
                RecordMap::new()
            }
        }
    }

    /// Merge `fresh` into the `name` collection and write it back.
    /// Returns the merged collection.
    pub async fn merge(&self, name: &str, fresh: RecordMap) -> CaptureResult<RecordMap> {
        if !self.enabled {
            return Ok(fresh);
        }
        let _guard = self.write_lock.lock().await;
        let fresh_count = fresh.len();
        let merged = merge_records(self.load(name).await, fresh);
        self.write_value(name, &Value::Object(merged.clone())).await?;
        debug!(
            collection = name,
            fresh = fresh_count,
            total = merged.len(),
            "persisted record collection"
        );
        Ok(merged)
    }

    /// Overwrite `name` with `value`.
    pub async fn write(&self, name: &str, value: &Value) -> CaptureResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        self.write_value(name, value).await
    }

    async fn write_value(&self, name: &str, value: &Value) -> CaptureResult<()> {
        let path = self.path(name);
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| CaptureError::file_write(&self.dir, err))?;
        let body = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|err| CaptureError::file_write(&path, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn map(value: Value) -> RecordMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn fresh_records_win_and_old_keys_survive() {
        let existing = map(json!({"a": {"v": 1}, "b": {"v": 1}}));
        let fresh = map(json!({"b": {"v": 2}, "c": {"v": 2}}));
        let merged = merge_records(existing, fresh);
        assert_eq!(Value::Object(merged), json!({"a": {"v": 1}, "b": {"v": 2}, "c": {"v": 2}}));
    }

    #[tokio::test]
    async fn merge_persists_across_store_instances() {
        let dir = tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        store
            .merge("followers", map(json!({"alice": {"name": "Alice"}})))
            .await
            .unwrap();

        let reopened = RecordStore::new(dir.path());
        let merged = reopened
            .merge("followers", map(json!({"bob": {"name": "Bob"}, "alice": {"name": "Alice B"}})))
            .await
            .unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["alice"]["name"], "Alice B");

        let on_disk: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("followers.json")).unwrap())
                .unwrap();
        assert_eq!(on_disk["bob"]["name"], "Bob");
    }

    #[tokio::test]
    async fn corrupt_collection_is_replaced() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("tweets.json"), "{not json").unwrap();
        let store = RecordStore::new(dir.path());
        let merged = store.merge("tweets", map(json!({"1": {}}))).await.unwrap();
        assert_eq!(merged.len(), 1);
    }

    #[tokio::test]
    async fn disabled_store_writes_nothing() {
        let dir = tempdir().unwrap();
        let store = RecordStore::disabled(dir.path().join("profile"));
        let merged = store.merge("tweets", map(json!({"1": {}}))).await.unwrap();
        assert_eq!(merged.len(), 1);
        store.write("api_data", &json!({"x": 1})).await.unwrap();
        assert!(!dir.path().join("profile").exists());
    }
}
