use std::sync::Arc;

use tokio::net::TcpListener;

use common::telemetry::{get_subscriber, init_subscriber};
use kiln::configuration::{StoreBackend, get_configuration};
use kiln::pool::WarmPool;
use kiln::registry::FunctionRegistry;
use kiln::store::{FileStore, PgStore, Store};
use kiln::vmm::VmManager;
use kiln::{App, database, startup};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let subscriber = get_subscriber("kiln".into(), "info".into(), std::io::stdout);
    init_subscriber(subscriber);

    let configuration = get_configuration().expect("Failed to read configuration.");

    let store = match configuration.registry.backend {
        StoreBackend::File => {
            let store = FileStore::new(&configuration.registry.data_dir)
                .await
                .expect("Failed to initialize the file store");
            Store::file_tree(store)
        }
        StoreBackend::Postgres => {
            database::run_migrations(&configuration.database.connection_string())
                .await
                .expect("Failed to run migrations");
            let pool = database::connection_pool(
                configuration.database.with_db(),
                configuration.database.max_connections,
            );
            Store::relational(PgStore::new(pool))
        }
    };

    let registry = Arc::new(FunctionRegistry::new(
        store,
        configuration.registry.max_code_bytes,
    ));
    let manager = Arc::new(VmManager::new(configuration.vmm.clone()));
    let pool = Arc::new(WarmPool::new(manager.clone(), &configuration.pool));
    let env = App::new(registry, manager.clone(), pool.clone());

    let address = format!(
        "{}:{}",
        configuration.application.host, configuration.application.port
    );
    tracing::info!("Starting server on {}", address);
    let listener = TcpListener::bind(address).await?;

    startup::run(listener, env, shutdown_signal()).await?;

    // The server is down; drain the pool and leave no VM running.
    tracing::info!("Shutting down, stopping warm pool and live VMs");
    pool.stop().await;
    if let Err(e) = manager.cleanup().await {
        tracing::error!("VM cleanup failed: {}", e);
    }

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl-c");
}
