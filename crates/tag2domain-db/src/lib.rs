//! # tag2domain-db
//!
//! PostgreSQL storage for tag2domain.
//!
//! This crate provides:
//! - Connection pool management
//! - The transactional [`PgStorageAdapter`] used by measurement handling
//! - Configurable intersection table layouts per tag type
//! - Taxonomy, tag and value lookups and auto-creation
//! - Bundled schema migrations
//!
//! ## Example
//!
//! ```rust,ignore
//! use tag2domain_db::{Database, StorageAdapter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/tag2domain").await?;
//!     db.migrate().await?;
//!
//!     let mut adapter = db.adapter();
//!     let open = adapter.get_open_tags(1, "domain", 42).await?;
//!     adapter.commit().await?;
//!     println!("{} open intervals", open.len());
//!     Ok(())
//! }
//! ```
pub mod adapter;
pub mod intersection_mapping;
pub mod pool;
pub mod schema_validation;
pub mod statements;
pub mod taxonomy;

// Test fixtures for integration tests
// Note: Compiled with migrations so integration tests (in tests/) get a migrated schema
#[cfg(feature = "migrations")]
pub mod test_fixtures;

use std::sync::Arc;

use sqlx::PgPool;

// Re-export core types
pub use tag2domain_core::*;

pub use adapter::PgStorageAdapter;
pub use intersection_mapping::{ColumnMapping, IntersectionTables};
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use schema_validation::{validate_identifier, validate_table_name};
pub use statements::{IntersectionStatements, StatementRegistry};

/// Bundled schema migrations.
#[cfg(feature = "migrations")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Connection pool plus compiled statements for the configured tag types.
///
/// Cheap to clone; every [`Database::adapter`] call hands out an adapter
/// with its own transaction over the shared pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    statements: Arc<StatementRegistry>,
}

impl Database {
    /// Create a database handle with the default intersection tables.
    pub fn new(pool: PgPool) -> Result<Self> {
        Self::with_tables(pool, &IntersectionTables::default())
    }

    /// Create a database handle with custom intersection tables.
    pub fn with_tables(pool: PgPool, tables: &IntersectionTables) -> Result<Self> {
        let statements = StatementRegistry::build(tables)?;
        Ok(Self {
            pool,
            statements: Arc::new(statements),
        })
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Self::new(pool)
    }

    /// Create with custom pool configuration and intersection tables.
    pub async fn connect_with_config(
        url: &str,
        config: PoolConfig,
        tables: &IntersectionTables,
    ) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Self::with_tables(pool, tables)
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// A fresh adapter over the shared pool.
    pub fn adapter(&self) -> PgStorageAdapter {
        PgStorageAdapter::with_statements(self.pool.clone(), Arc::clone(&self.statements))
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Tag types with a configured intersection table.
    pub fn tag_types(&self) -> impl Iterator<Item = &str> {
        self.statements.tag_types()
    }
}
