use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

pub async fn run_migrations(connection_string: &str) -> Result<(), sqlx::Error> {
    let pool = PgPool::connect(connection_string).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    pool.close().await;
    Ok(())
}

pub fn connection_pool(
    options: sqlx::postgres::PgConnectOptions,
    max_connections: u32,
) -> PgPool {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect_lazy_with(options)
}
