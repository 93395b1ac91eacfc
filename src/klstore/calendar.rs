//! 交易日历：按名称保存的交易时段，写入时合并重叠或相接的区间

use super::KlineStore;
use crate::klcommon::{Calendar, Result};
use rusqlite::params;
use tracing::info;

/// 合并重叠或相接的区间
pub fn merge_windows(mut windows: Vec<(i64, i64)>) -> Vec<(i64, i64)> {
    windows.retain(|(s, e)| s < e);
    windows.sort();
    let mut out: Vec<(i64, i64)> = Vec::with_capacity(windows.len());
    for (s, e) in windows {
        match out.last_mut() {
            Some(last) if s <= last.1 => last.1 = last.1.max(e),
            _ => out.push((s, e)),
        }
    }
    out
}

impl KlineStore {
    /// 写入交易时段，与已有时段合并后整体替换
    pub fn insert_calendars(&self, name: &str, windows: &[(i64, i64)]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut all: Vec<(i64, i64)> = {
            let mut stmt = tx.prepare_cached("SELECT start_ms, stop_ms FROM calendars WHERE name = ?1")?;
            let rows = stmt.query_map(params![name], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        all.extend_from_slice(windows);
        let merged = merge_windows(all);
        tx.execute("DELETE FROM calendars WHERE name = ?1", params![name])?;
        {
            let mut stmt =
                tx.prepare_cached("INSERT INTO calendars (name, start_ms, stop_ms) VALUES (?1, ?2, ?3)")?;
            for (s, e) in &merged {
                stmt.execute(params![name, s, e])?;
            }
        }
        tx.commit()?;
        info!(target: "klstore", name, windows = merged.len(), "交易日历已更新");
        Ok(merged.len())
    }

    /// 读取与 [start, end) 相交的交易时段；end 为 0 表示不限
    pub fn get_calendars(&self, name: &str, start: i64, end: i64) -> Result<Vec<Calendar>> {
        let stop = if end > 0 { end } else { i64::MAX };
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, start_ms, stop_ms FROM calendars
             WHERE name = ?1 AND stop_ms > ?2 AND start_ms < ?3 ORDER BY start_ms",
        )?;
        let rows = stmt.query_map(params![name, start, stop], |row| {
            Ok(Calendar { id: row.get(0)?, name: name.to_string(), start_ms: row.get(1)?, stop_ms: row.get(2)? })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// 全部日历名称
    pub fn calendar_names(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached("SELECT DISTINCT name FROM calendars ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
