use std::future::Future;

use tokio::net::TcpListener;

use crate::{App, handlers::app, vmm};

/// Serves the API until `shutdown` resolves. Spawns the warm-pool
/// refill loop and the VM reaper alongside the server.
pub async fn run(
    listener: TcpListener,
    env: App,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    env.manager().sweep_stale_vms().await;
    env.pool().start();
    tokio::spawn(vmm::monitor::start_vm_reaper(env.manager().clone()));

    let app = app(env);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
}
