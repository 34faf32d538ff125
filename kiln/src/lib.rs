pub mod configuration;
pub mod database;
pub mod errors;
pub mod handlers;
pub mod invoker;
pub mod model;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod startup;
pub mod store;
pub mod vmm;

use std::sync::Arc;

use crate::invoker::Invoker;
use crate::pool::WarmPool;
use crate::registry::FunctionRegistry;
use crate::vmm::VmManager;

#[derive(Clone)]
pub struct App {
    registry: Arc<FunctionRegistry>,
    manager: Arc<VmManager>,
    pool: Arc<WarmPool>,
    invoker: Arc<Invoker>,
}

impl App {
    pub fn new(
        registry: Arc<FunctionRegistry>,
        manager: Arc<VmManager>,
        pool: Arc<WarmPool>,
    ) -> Self {
        let invoker = Arc::new(Invoker::new(
            registry.clone(),
            pool.clone(),
            manager.clone(),
        ));
        Self {
            registry,
            manager,
            pool,
            invoker,
        }
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<VmManager> {
        &self.manager
    }

    pub fn pool(&self) -> &Arc<WarmPool> {
        &self.pool
    }

    pub fn invoker(&self) -> &Invoker {
        &self.invoker
    }
}
