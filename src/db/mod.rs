// src/db/mod.rs

use sqlx::{PgPool, Postgres, Pool};

pub mod locks;

pub async fn connect(database_url: &str) -> Result<Pool<Postgres>, sqlx::Error> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    tracing::info!("connected to PostgreSQL");
    Ok(pool)
}

/// Applies `migrations/` to the connected database.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("schema migrations applied");
    Ok(())
}
