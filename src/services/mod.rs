//! Services is a core layer for the app business logic like
//! validation, authorization, etc.

pub mod coupons;
pub mod types;

pub use self::coupons::*;
pub use self::types::ServiceFuture;

use std::sync::Arc;

use diesel::connection::AnsiTransactionManager;
use diesel::pg::Pg;
use diesel::Connection;
use failure::Error as FailureError;
use failure::Fail;
use futures_cpupool::CpuPool;
use r2d2::{ManageConnection, Pool, PooledConnection};

use config::Config;
use errors::Error;
use models::UserId;
use repos::ReposFactory;

/// Static context for services: everything shared between requests
pub struct StaticContext<T, M, F>
where
    T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static,
    M: ManageConnection<Connection = T>,
    F: ReposFactory<T>,
{
    pub db_pool: Pool<M>,
    pub cpu_pool: CpuPool,
    pub config: Arc<Config>,
    pub repo_factory: F,
}

impl<T, M, F> Clone for StaticContext<T, M, F>
where
    T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static,
    M: ManageConnection<Connection = T>,
    F: ReposFactory<T>,
{
    fn clone(&self) -> Self {
        Self {
            db_pool: self.db_pool.clone(),
            cpu_pool: self.cpu_pool.clone(),
            config: self.config.clone(),
            repo_factory: self.repo_factory.clone(),
        }
    }
}

impl<T, M, F> StaticContext<T, M, F>
where
    T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static,
    M: ManageConnection<Connection = T>,
    F: ReposFactory<T>,
{
    /// Create static context
    pub fn new(db_pool: Pool<M>, cpu_pool: CpuPool, config: Arc<Config>, repo_factory: F) -> Self {
        Self {
            db_pool,
            cpu_pool,
            config,
            repo_factory,
        }
    }
}

/// Dynamic context for services: the per-request caller identity
#[derive(Clone, Debug, Default)]
pub struct DynamicContext {
    pub user_id: Option<UserId>,
}

impl DynamicContext {
    /// Create dynamic context
    pub fn new(user_id: Option<UserId>) -> Self {
        Self { user_id }
    }
}

/// Service
pub struct Service<T, M, F>
where
    T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static,
    M: ManageConnection<Connection = T>,
    F: ReposFactory<T>,
{
    pub static_context: StaticContext<T, M, F>,
    pub dynamic_context: DynamicContext,
}

impl<T, M, F> Service<T, M, F>
where
    T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static,
    M: ManageConnection<Connection = T>,
    F: ReposFactory<T>,
{
    /// Create service
    pub fn new(static_context: StaticContext<T, M, F>, dynamic_context: DynamicContext) -> Self {
        Self {
            static_context,
            dynamic_context,
        }
    }

    /// Spawns a blocking unit of db work on the cpu pool. Each request runs
    /// on its own worker with its own pooled connection.
    pub fn spawn_on_pool<R, Func>(&self, f: Func) -> ServiceFuture<R>
    where
        R: Send + 'static,
        Func: FnOnce(PooledConnection<M>) -> Result<R, FailureError> + Send + 'static,
    {
        let db_pool = self.static_context.db_pool.clone();
        let cpu_pool = self.static_context.cpu_pool.clone();

        Box::new(cpu_pool.spawn_fn(move || {
            db_pool
                .get()
                .map_err(|e| e.context(Error::Connection).into())
                .and_then(f)
        }))
    }
}
