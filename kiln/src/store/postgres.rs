use std::collections::HashMap;
use std::str::FromStr;

use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::StoreError;
use crate::model::functions::{Function, Runtime};

const COLUMNS: &str =
    "id, name, runtime, handler, code, memory_mb, timeout_sec, environment, code_path, created_at, updated_at";

/// Relational backend: one `functions` table, unique index on `name`,
/// code inline in the `code` column.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_function(row: PgRow) -> Result<Function, StoreError> {
        let runtime: String = row.try_get("runtime")?;
        let runtime = Runtime::from_str(&runtime)
            .map_err(|_| StoreError::Invalid(format!("unknown runtime '{runtime}' in store")))?;
        let environment: Json<HashMap<String, String>> = row.try_get("environment")?;

        Ok(Function {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            runtime,
            handler: row.try_get("handler")?,
            code: row.try_get("code")?,
            memory_mb: row.try_get("memory_mb")?,
            timeout_sec: row.try_get("timeout_sec")?,
            environment: environment.0,
            code_path: row.try_get("code_path")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub async fn create(&self, function: &Function) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO functions (id, name, runtime, handler, code, memory_mb, timeout_sec,
                       environment, code_path, created_at, updated_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(function.id)
        .bind(&function.name)
        .bind(function.runtime.to_string())
        .bind(&function.handler)
        .bind(&function.code)
        .bind(function.memory_mb)
        .bind(function.timeout_sec)
        .bind(Json(&function.environment))
        .bind(&function.code_path)
        .bind(function.created_at)
        .bind(function.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::AlreadyExists(function.name.clone())
            }
            _ => StoreError::Sqlx(e),
        })?;

        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<Function, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM functions WHERE name = $1"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;

        Self::row_to_function(row)
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Function, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM functions WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;

        Self::row_to_function(row)
    }

    pub async fn update(&self, function: &Function) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
UPDATE functions
SET runtime = $2, handler = $3, code = $4, memory_mb = $5, timeout_sec = $6,
    environment = $7, code_path = $8, updated_at = $9
WHERE name = $1
            "#,
        )
        .bind(&function.name)
        .bind(function.runtime.to_string())
        .bind(&function.handler)
        .bind(&function.code)
        .bind(function.memory_mb)
        .bind(function.timeout_sec)
        .bind(Json(&function.environment))
        .bind(&function.code_path)
        .bind(function.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM functions WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Function>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM functions ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut functions = Vec::with_capacity(rows.len());
        for row in rows {
            let mut function = Self::row_to_function(row)?;
            function.code = String::new();
            functions.push(function);
        }
        Ok(functions)
    }

    pub async fn save_code(&self, name: &str, code: &[u8]) -> Result<String, StoreError> {
        let code = std::str::from_utf8(code)
            .map_err(|_| StoreError::Invalid("code must be valid UTF-8".to_string()))?;

        let result = sqlx::query("UPDATE functions SET code = $2 WHERE name = $1")
            .bind(name)
            .bind(code)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(format!("db://functions/{name}/code"))
    }

    pub async fn get_code(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let row = sqlx::query("SELECT code FROM functions WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;

        let code: String = row.try_get("code")?;
        Ok(code.into_bytes())
    }
}
