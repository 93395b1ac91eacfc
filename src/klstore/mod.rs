//! K线存储 - SQLite 多周期K线库
//!
//! 持久化周期 1m/5m/15m/1h/1d，外加 kinfo（有效区间）、khole（缺口）、
//! kline_un（未完成K线）、复权因子、交易日历与品种表。
//! 所有接口都是同步的，异步调用方通过 `spawn_blocking` 使用。

pub mod adj;
pub mod calendar;
pub mod export;
pub mod holes;
pub mod query;
pub mod range;
pub mod schema;
pub mod symbols;
pub mod unfinished;

use crate::klcommon::{AdjFactor, AppError, ClockRef, Result};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

pub use symbols::SymbolCache;

/// 数据库连接池类型
pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// 获取连接的最大尝试次数
const CONN_RETRY_TIMES: u32 = 3;

/// K线存储句柄，可廉价克隆
#[derive(Clone)]
pub struct KlineStore {
    pool: DbPool,
    clock: ClockRef,
    symbols: Arc<SymbolCache>,
    adj_cache: Arc<Mutex<HashMap<i32, Arc<Vec<AdjFactor>>>>>,
}

impl std::fmt::Debug for KlineStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KlineStore").field("clock", &self.clock).finish()
    }
}

impl KlineStore {
    /// 打开（或创建）数据库文件并初始化表结构
    pub fn open<P: AsRef<Path>>(db_path: P, pool_size: u32, clock: ClockRef) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                info!(target: "klstore", log_type = "module", path = %parent.display(), "创建数据库目录");
            }
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA cache_size = -65536;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = OFF;
                 PRAGMA busy_timeout = 5000;",
            )
        });

        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(|e| {
                let pool_error = AppError::DatabaseError(format!("创建连接池失败: {}", e));
                error!(
                    target: "klstore",
                    message = "创建连接池失败",
                    error.summary = pool_error.get_error_type_summary(),
                    error.details = %pool_error,
                );
                pool_error
            })?;

        let store = Self {
            pool,
            clock,
            symbols: Arc::new(SymbolCache::default()),
            adj_cache: Arc::new(Mutex::new(HashMap::new())),
        };
        {
            let conn = store.conn()?;
            schema::init_schema(&conn)?;
        }
        store.load_exsymbols()?;
        info!(target: "klstore", log_type = "module", path = %db_path.display(), pool_size, "K线存储已打开");
        Ok(store)
    }

    pub fn clock(&self) -> &ClockRef {
        &self.clock
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// 获取连接；失败时按 1s×n 退避，最多尝试 3 次
    pub fn conn(&self) -> Result<DbConn> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.pool.get() {
                Ok(conn) => return Ok(conn),
                Err(e) if attempt < CONN_RETRY_TIMES => {
                    warn!(target: "klstore", attempt, error.details = %e, "获取数据库连接失败，稍后重试");
                    std::thread::sleep(Duration::from_secs(attempt as u64));
                }
                Err(e) => {
                    let err = AppError::from(e);
                    error!(
                        target: "klstore",
                        message = "获取数据库连接失败",
                        error.summary = err.get_error_type_summary(),
                        error.details = %err,
                    );
                    return Err(err);
                }
            }
        }
    }

    /// 在阻塞线程池里执行存储操作，供异步任务调用
    pub async fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&KlineStore) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| AppError::Unknown(format!("存储任务异常退出: {}", e)))?
    }

    pub(crate) fn symbol_cache(&self) -> &SymbolCache {
        &self.symbols
    }

    pub(crate) fn adj_cache(&self) -> &Mutex<HashMap<i32, Arc<Vec<AdjFactor>>>> {
        &self.adj_cache
    }
}
