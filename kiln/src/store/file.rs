use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use super::StoreError;
use crate::model::functions::Function;

const METADATA_FILE: &str = "metadata.json";
const CODE_FILE: &str = "code.bin";

/// File-tree backend: `<root>/functions/<name>/{metadata.json,code.bin}`.
///
/// Uniqueness on `name` comes from the directory existence check, made
/// safe by a per-name mutex serializing writers. All writes go through
/// write-to-temp-then-rename so a crash never leaves a torn file.
pub struct FileStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileStore {
    pub async fn new(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = data_dir.into().join("functions");
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    async fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn function_dir(&self, name: &str) -> Result<PathBuf, StoreError> {
        // Names are validated upstream; re-check here so a raw store call
        // can never escape the tree.
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(StoreError::Invalid(format!("invalid function name '{name}'")));
        }
        Ok(self.root.join(name))
    }

    async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn write_metadata(dir: &Path, function: &Function) -> Result<(), StoreError> {
        // The blob lives in code.bin; the echo is not persisted twice.
        let mut record = function.clone();
        record.code = String::new();
        let bytes = serde_json::to_vec_pretty(&record)?;
        Self::write_atomically(&dir.join(METADATA_FILE), &bytes).await
    }

    async fn read_metadata(dir: &Path) -> Result<Function, StoreError> {
        let bytes = match tokio::fs::read(dir.join(METADATA_FILE)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound);
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn create(&self, function: &Function) -> Result<(), StoreError> {
        let dir = self.function_dir(&function.name)?;
        let lock = self.name_lock(&function.name).await;
        let _guard = lock.lock().await;

        if tokio::fs::try_exists(&dir).await? {
            return Err(StoreError::AlreadyExists(function.name.clone()));
        }
        tokio::fs::create_dir_all(&dir).await?;
        Self::write_metadata(&dir, function).await
    }

    pub async fn get(&self, name: &str) -> Result<Function, StoreError> {
        let dir = self.function_dir(name)?;
        let mut function = Self::read_metadata(&dir).await?;
        match tokio::fs::read(dir.join(CODE_FILE)).await {
            Ok(bytes) => function.code = String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(function)
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Function, StoreError> {
        // No secondary index on disk; scan the tree.
        for function in self.list().await? {
            if function.id == id {
                return self.get(&function.name).await;
            }
        }
        Err(StoreError::NotFound)
    }

    pub async fn update(&self, function: &Function) -> Result<(), StoreError> {
        let dir = self.function_dir(&function.name)?;
        let lock = self.name_lock(&function.name).await;
        let _guard = lock.lock().await;

        if !tokio::fs::try_exists(&dir).await? {
            return Err(StoreError::NotFound);
        }
        Self::write_metadata(&dir, function).await
    }

    pub async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let dir = self.function_dir(name)?;
        let lock = self.name_lock(name).await;
        let _guard = lock.lock().await;

        if !tokio::fs::try_exists(&dir).await? {
            return Err(StoreError::NotFound);
        }
        tokio::fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Function>, StoreError> {
        let mut functions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            match Self::read_metadata(&entry.path()).await {
                Ok(function) => functions.push(function),
                // A directory without metadata is a half-created function
                // the per-name lock will finish or clean up; skip it.
                Err(StoreError::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        functions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(functions)
    }

    pub async fn save_code(&self, name: &str, code: &[u8]) -> Result<String, StoreError> {
        let dir = self.function_dir(name)?;
        let lock = self.name_lock(name).await;
        let _guard = lock.lock().await;

        if !tokio::fs::try_exists(&dir).await? {
            return Err(StoreError::NotFound);
        }
        Self::write_atomically(&dir.join(CODE_FILE), code).await?;
        Ok(format!("file://functions/{name}/{CODE_FILE}"))
    }

    pub async fn get_code(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let dir = self.function_dir(name)?;
        match tokio::fs::read(dir.join(CODE_FILE)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::model::functions::Runtime;

    fn function(name: &str) -> Function {
        Function {
            id: Uuid::new_v4(),
            name: name.to_string(),
            runtime: Runtime::Nodejs20,
            handler: "index.handler".to_string(),
            code: String::new(),
            memory_mb: 128,
            timeout_sec: 30,
            environment: HashMap::new(),
            code_path: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let (_dir, store) = store().await;
        let f = function("hello");
        store.create(&f).await.unwrap();

        let loaded = store.get("hello").await.unwrap();
        assert_eq!(loaded.id, f.id);
        assert_eq!(loaded.handler, f.handler);

        let by_id = store.get_by_id(f.id).await.unwrap();
        assert_eq!(by_id.name, "hello");
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let (_dir, store) = store().await;
        store.create(&function("hello")).await.unwrap();
        match store.create(&function("hello")).await {
            Err(StoreError::AlreadyExists(name)) => assert_eq!(name, "hello"),
            other => panic!("expected AlreadyExists, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_update_delete_missing_is_not_found() {
        let (_dir, store) = store().await;
        assert!(matches!(store.get("ghost").await, Err(StoreError::NotFound)));
        assert!(matches!(
            store.update(&function("ghost")).await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.delete("ghost").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn list_orders_by_created_at_descending() {
        let (_dir, store) = store().await;
        let now = Utc::now();
        for (i, name) in ["oldest", "middle", "newest"].iter().enumerate() {
            let mut f = function(name);
            f.created_at = now + Duration::seconds(i as i64);
            store.create(&f).await.unwrap();
        }

        let names: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, ["newest", "middle", "oldest"]);
    }

    #[tokio::test]
    async fn list_on_empty_store_is_empty() {
        let (_dir, store) = store().await;
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn code_round_trips_and_overwrites() {
        let (_dir, store) = store().await;
        store.create(&function("hello")).await.unwrap();

        let locator = store.save_code("hello", b"v1").await.unwrap();
        assert_eq!(locator, "file://functions/hello/code.bin");
        assert_eq!(store.get_code("hello").await.unwrap(), b"v1");

        // Same locator, new bytes
        let locator2 = store.save_code("hello", b"v2").await.unwrap();
        assert_eq!(locator, locator2);
        assert_eq!(store.get_code("hello").await.unwrap(), b"v2");
    }

    #[tokio::test]
    async fn traversal_names_are_rejected() {
        let (_dir, store) = store().await;
        assert!(matches!(
            store.get("../escape").await,
            Err(StoreError::Invalid(_))
        ));
    }
}
