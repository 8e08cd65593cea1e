//! Database plane: idempotency and poison stores, audit tables, and
//! retention jobs, all on Diesel/Postgres behind an r2d2 pool.

pub mod audit;
pub mod idempotency;
pub mod models;
pub mod poison;
pub mod retention;
pub mod schema;

use std::sync::Arc;

use diesel::pg::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};

use agentmq_core::error::QueueError;

/// Shared connection pool for the audit/idempotency backend.
pub type DbPool = Arc<Pool<ConnectionManager<PgConnection>>>;

/// Build the connection pool from the configured database URL.
pub fn init_pool(database_url: &str, pool_size: u32) -> Result<DbPool, QueueError> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = Pool::builder()
        .max_size(pool_size)
        .build(manager)
        .map_err(|e| QueueError::Database {
            message: format!("Failed to create connection pool: {}", e),
        })?;
    Ok(Arc::new(pool))
}

pub(crate) fn get_connection(
    pool: &DbPool,
) -> Result<PooledConnection<ConnectionManager<PgConnection>>, QueueError> {
    pool.get().map_err(|e| QueueError::Database {
        message: format!("Failed to get database connection: {}", e),
    })
}
