//! Validation, defaulting and code-blob orchestration on top of the store.

use std::str::FromStr;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;
use validator::Validate;

use crate::errors::Error;
use crate::model::functions::{
    CreateFunctionRequest, DEFAULT_MEMORY_MB, DEFAULT_TIMEOUT_SEC, Function, MAX_MEMORY_MB,
    MAX_TIMEOUT_SEC, MIN_MEMORY_MB, MIN_TIMEOUT_SEC, Runtime, UpdateFunctionRequest,
};
use crate::store::Store;

pub struct FunctionRegistry {
    store: Store,
    max_code_bytes: usize,
}

impl FunctionRegistry {
    pub fn new(store: Store, max_code_bytes: usize) -> Self {
        Self {
            store,
            max_code_bytes,
        }
    }

    pub async fn create_function(&self, request: CreateFunctionRequest) -> Result<Function, Error> {
        request.validate()?;
        let runtime = parse_runtime(&request.runtime)?;
        self.check_code_size(&request.code)?;

        let now = Utc::now();
        let mut function = Function {
            id: Uuid::new_v4(),
            name: request.name,
            runtime,
            handler: request.handler,
            code: request.code,
            memory_mb: request.memory_mb.unwrap_or(DEFAULT_MEMORY_MB),
            timeout_sec: request.timeout_sec.unwrap_or(DEFAULT_TIMEOUT_SEC),
            environment: request.environment.unwrap_or_default(),
            code_path: String::new(),
            created_at: now,
            updated_at: now,
        };

        self.store.create(&function).await?;

        // The metadata record exists; store the blob and persist its
        // locator. Either step failing rolls the record back.
        match self.persist_code(&mut function).await {
            Ok(()) => Ok(function),
            Err(e) => {
                if let Err(del) = self.store.delete(&function.name).await {
                    warn!(
                        "failed to roll back function '{}' after code save error: {}",
                        function.name, del
                    );
                }
                Err(e)
            }
        }
    }

    async fn persist_code(&self, function: &mut Function) -> Result<(), Error> {
        let locator = self
            .store
            .save_code(&function.name, function.code.as_bytes())
            .await?;
        function.code_path = locator;
        self.store.update(function).await?;
        Ok(())
    }

    pub async fn get_function(&self, name: &str) -> Result<Function, Error> {
        Ok(self.store.get(name).await?)
    }

    pub async fn get_function_by_id(&self, id: Uuid) -> Result<Function, Error> {
        Ok(self.store.get_by_id(id).await?)
    }

    pub async fn list_functions(&self) -> Result<Vec<Function>, Error> {
        Ok(self.store.list().await?)
    }

    pub async fn delete_function(&self, name: &str) -> Result<(), Error> {
        Ok(self.store.delete(name).await?)
    }

    pub async fn get_code(&self, name: &str) -> Result<String, Error> {
        let bytes = self.store.get_code(name).await?;
        String::from_utf8(bytes).map_err(|_| Error::InternalServerError)
    }

    /// Applies a three-valued patch: absent fields are untouched, `null`
    /// clears back to the default where one exists, values replace.
    pub async fn update_function(
        &self,
        name: &str,
        patch: UpdateFunctionRequest,
    ) -> Result<Function, Error> {
        let mut function = self.store.get(name).await?;

        if let Some(runtime) = &patch.runtime {
            let runtime = runtime
                .as_deref()
                .ok_or_else(|| Error::Invalid("runtime cannot be cleared".to_string()))?;
            function.runtime = parse_runtime(runtime)?;
        }

        if let Some(handler) = patch.handler {
            let handler = handler
                .filter(|h| !h.is_empty())
                .ok_or_else(|| Error::Invalid("handler cannot be cleared".to_string()))?;
            function.handler = handler;
        }

        if let Some(memory_mb) = patch.memory_mb {
            let memory_mb = memory_mb.unwrap_or(DEFAULT_MEMORY_MB);
            if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&memory_mb) {
                return Err(Error::Invalid(format!(
                    "memory_mb must be between {MIN_MEMORY_MB} and {MAX_MEMORY_MB}"
                )));
            }
            function.memory_mb = memory_mb;
        }

        if let Some(timeout_sec) = patch.timeout_sec {
            let timeout_sec = timeout_sec.unwrap_or(DEFAULT_TIMEOUT_SEC);
            if !(MIN_TIMEOUT_SEC..=MAX_TIMEOUT_SEC).contains(&timeout_sec) {
                return Err(Error::Invalid(format!(
                    "timeout_sec must be between {MIN_TIMEOUT_SEC} and {MAX_TIMEOUT_SEC}"
                )));
            }
            function.timeout_sec = timeout_sec;
        }

        if let Some(environment) = patch.environment {
            function.environment = environment.unwrap_or_default();
        }

        let new_code = match patch.code {
            Some(Some(code)) if !code.is_empty() => Some(code),
            Some(_) => return Err(Error::Invalid("code cannot be cleared".to_string())),
            None => None,
        };

        if let Some(code) = new_code {
            self.check_code_size(&code)?;
            // New blob first, locator second, metadata last, so a crash
            // mid-update never leaves metadata pointing at missing code.
            let locator = self.store.save_code(name, code.as_bytes()).await?;
            function.code = code;
            function.code_path = locator;
        }

        // Strictly monotonic even under back-to-back updates
        let mut now = Utc::now();
        if now <= function.updated_at {
            now = function.updated_at + chrono::Duration::microseconds(1);
        }
        function.updated_at = now;

        self.store.update(&function).await?;
        Ok(function)
    }

    fn check_code_size(&self, code: &str) -> Result<(), Error> {
        if code.len() > self.max_code_bytes {
            return Err(Error::Invalid(format!(
                "code exceeds the {} byte limit",
                self.max_code_bytes
            )));
        }
        Ok(())
    }
}

fn parse_runtime(runtime: &str) -> Result<Runtime, Error> {
    Runtime::from_str(runtime)
        .map_err(|_| Error::Invalid(format!("unsupported runtime '{runtime}'")))
}
