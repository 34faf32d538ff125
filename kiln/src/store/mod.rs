//! Function metadata + code persistence.
//!
//! Two backends behind one surface: a file tree (one directory per
//! function) and Postgres. The backend is chosen at construction and
//! never switches at runtime.

use uuid::Uuid;

use crate::model::functions::Function;

mod file;
mod postgres;

pub use file::FileStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("function not found")]
    NotFound,

    #[error("function '{0}' already exists")]
    AlreadyExists(String),

    #[error("{0}")]
    Invalid(String),

    #[error("backend i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("metadata encoding error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub enum Store {
    FileTree(FileStore),
    Relational(PgStore),
}

impl Store {
    pub fn file_tree(store: FileStore) -> Self {
        Store::FileTree(store)
    }

    pub fn relational(store: PgStore) -> Self {
        Store::Relational(store)
    }

    pub async fn create(&self, function: &Function) -> Result<(), StoreError> {
        match self {
            Store::FileTree(s) => s.create(function).await,
            Store::Relational(s) => s.create(function).await,
        }
    }

    pub async fn get(&self, name: &str) -> Result<Function, StoreError> {
        match self {
            Store::FileTree(s) => s.get(name).await,
            Store::Relational(s) => s.get(name).await,
        }
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Function, StoreError> {
        match self {
            Store::FileTree(s) => s.get_by_id(id).await,
            Store::Relational(s) => s.get_by_id(id).await,
        }
    }

    pub async fn update(&self, function: &Function) -> Result<(), StoreError> {
        match self {
            Store::FileTree(s) => s.update(function).await,
            Store::Relational(s) => s.update(function).await,
        }
    }

    pub async fn delete(&self, name: &str) -> Result<(), StoreError> {
        match self {
            Store::FileTree(s) => s.delete(name).await,
            Store::Relational(s) => s.delete(name).await,
        }
    }

    /// Records ordered by descending `created_at`. `code` is left empty;
    /// the blob is addressed through `code_path`.
    pub async fn list(&self) -> Result<Vec<Function>, StoreError> {
        match self {
            Store::FileTree(s) => s.list().await,
            Store::Relational(s) => s.list().await,
        }
    }

    /// Stores the code blob for `name` and returns an opaque locator only
    /// meaningful to this backend. Overwrites any previous blob.
    pub async fn save_code(&self, name: &str, code: &[u8]) -> Result<String, StoreError> {
        match self {
            Store::FileTree(s) => s.save_code(name, code).await,
            Store::Relational(s) => s.save_code(name, code).await,
        }
    }

    pub async fn get_code(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        match self {
            Store::FileTree(s) => s.get_code(name).await,
            Store::Relational(s) => s.get_code(name).await,
        }
    }
}
