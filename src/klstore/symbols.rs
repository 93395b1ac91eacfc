//! 品种表与内存缓存
//!
//! 两个映射（自然键 -> 品种、id -> 品种）放在同一把锁下。写入方先提交数据库，
//! 再在锁内重新加载，因此缓存里不会出现未提交的 id。

use super::KlineStore;
use crate::klcommon::{AppError, ExSymbol, Result};
use rusqlite::{params, Connection, Row};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

type SymbolKey = (String, String, String);

#[derive(Default)]
struct SymbolMaps {
    by_key: HashMap<SymbolKey, Arc<ExSymbol>>,
    by_id: HashMap<i32, Arc<ExSymbol>>,
}

#[derive(Default)]
pub struct SymbolCache {
    inner: Mutex<SymbolMaps>,
}

impl SymbolCache {
    fn lock(&self) -> std::sync::MutexGuard<'_, SymbolMaps> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get(&self, key: &SymbolKey) -> Option<Arc<ExSymbol>> {
        self.lock().by_key.get(key).cloned()
    }

    fn get_by_id(&self, id: i32) -> Option<Arc<ExSymbol>> {
        self.lock().by_id.get(&id).cloned()
    }

    /// 合并新读取的行；已有且内容未变的条目保持原指针
    fn merge(&self, rows: Vec<ExSymbol>) {
        let mut maps = self.lock();
        for row in rows {
            if let Some(old) = maps.by_id.get(&row.id) {
                if **old == row {
                    continue;
                }
            }
            let item = Arc::new(row);
            maps.by_key.insert(item.key(), item.clone());
            maps.by_id.insert(item.id, item);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn row_to_symbol(row: &Row<'_>) -> rusqlite::Result<ExSymbol> {
    Ok(ExSymbol {
        id: row.get(0)?,
        exchange: row.get(1)?,
        exg_real: row.get(2)?,
        market: row.get(3)?,
        symbol: row.get(4)?,
        combined: row.get::<_, i64>(5)? != 0,
        list_ms: row.get(6)?,
        delist_ms: row.get(7)?,
    })
}

const SELECT_SYMBOL: &str =
    "SELECT id, exchange, exg_real, market, symbol, combined, list_ms, delist_ms FROM exsymbol";

fn read_all(conn: &Connection) -> Result<Vec<ExSymbol>> {
    let mut stmt = conn.prepare_cached(SELECT_SYMBOL)?;
    let rows = stmt.query_map([], row_to_symbol)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

impl KlineStore {
    /// 从数据库重新加载全部品种
    pub fn load_exsymbols(&self) -> Result<usize> {
        let conn = self.conn()?;
        let rows = read_all(&conn)?;
        let count = rows.len();
        self.symbol_cache().merge(rows);
        debug!(target: "klstore", count, "品种缓存已加载");
        Ok(count)
    }

    /// 确保品种存在，缺失的先入库再刷新缓存，按输入顺序返回
    pub fn ensure_exsymbols(&self, items: &[ExSymbol]) -> Result<Vec<Arc<ExSymbol>>> {
        let cache = self.symbol_cache();
        let missing: Vec<&ExSymbol> = items.iter().filter(|it| cache.get(&it.key()).is_none()).collect();
        if !missing.is_empty() {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR IGNORE INTO exsymbol (exchange, exg_real, market, symbol, combined, list_ms, delist_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for it in &missing {
                    let exg_real = if it.exg_real.is_empty() { &it.exchange } else { &it.exg_real };
                    stmt.execute(params![
                        it.exchange,
                        exg_real,
                        it.market,
                        it.symbol,
                        it.combined as i64,
                        it.list_ms,
                        it.delist_ms
                    ])?;
                }
            }
            tx.commit()?;
            cache.merge(read_all(&conn)?);
            info!(target: "klstore", log_type = "module", added = missing.len(), "新增品种已入库");
        }

        items
            .iter()
            .map(|it| {
                cache.get(&it.key()).ok_or_else(|| {
                    AppError::DataError(format!("品种入库后仍不可见: {}:{}:{}", it.exchange, it.market, it.symbol))
                })
            })
            .collect()
    }

    /// 按自然键获取品种，不存在时创建
    pub fn get_exsymbol(&self, exchange: &str, market: &str, symbol: &str) -> Result<Arc<ExSymbol>> {
        let key = (exchange.to_string(), market.to_string(), symbol.to_string());
        if let Some(found) = self.symbol_cache().get(&key) {
            return Ok(found);
        }
        let mut created = self.ensure_exsymbols(&[ExSymbol::new_key(exchange, market, symbol)])?;
        created
            .pop()
            .ok_or_else(|| AppError::DataError(format!("无法创建品种 {}:{}:{}", exchange, market, symbol)))
    }

    /// 只查缓存，不创建
    pub fn find_exsymbol(&self, exchange: &str, market: &str, symbol: &str) -> Option<Arc<ExSymbol>> {
        self.symbol_cache()
            .get(&(exchange.to_string(), market.to_string(), symbol.to_string()))
    }

    pub fn get_exsymbol_by_id(&self, id: i32) -> Result<Arc<ExSymbol>> {
        if let Some(found) = self.symbol_cache().get_by_id(id) {
            return Ok(found);
        }
        self.load_exsymbols()?;
        self.symbol_cache()
            .get_by_id(id)
            .ok_or_else(|| AppError::DataError(format!("品种 id 不存在: {}", id)))
    }

    /// 更新上市/下市时间，这是品种唯一可变的字段
    pub fn set_list_ms(&self, id: i32, list_ms: i64, delist_ms: i64) -> Result<Arc<ExSymbol>> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE exsymbol SET list_ms = ?1, delist_ms = ?2 WHERE id = ?3",
            params![list_ms, delist_ms, id],
        )?;
        if changed == 0 {
            return Err(AppError::DataError(format!("品种 id 不存在: {}", id)));
        }
        let row = conn.query_row(&format!("{} WHERE id = ?1", SELECT_SYMBOL), params![id], row_to_symbol)?;
        self.symbol_cache().merge(vec![row]);
        self.get_exsymbol_by_id(id)
    }

    /// 缓存中的全部品种，按 id 升序
    pub fn all_exsymbols(&self) -> Vec<Arc<ExSymbol>> {
        let maps = self.symbol_cache().lock();
        let mut out: Vec<Arc<ExSymbol>> = maps.by_id.values().cloned().collect();
        out.sort_by_key(|s| s.id);
        out
    }
}
