//! 未完成K线（kline_un）
//!
//! 1m 行保存实时推送的部分K线，stop_ms 为最后一次写入时间；
//! 更高周期的行保存当前桶内已完成部分的聚合，stop_ms 为已覆盖到的时间。
//! 读取时把两者合并得到完整的未完成K线。

use super::range::require_stored;
use super::KlineStore;
use crate::klcommon::timeframe::{align_tf_msecs, bucket_end, StoredTf, MINUTE_MS, STORED_TFS};
use crate::klcommon::{AppError, Kline, Result, UnfinishedBar};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

/// 实时部分K线所在的周期
const LIVE_TF: &str = "1m";

pub(crate) fn read_un(conn: &Connection, sid: i32, tf: &str) -> Result<Option<UnfinishedBar>> {
    let row = conn
        .query_row(
            "SELECT start_ms, stop_ms, open, high, low, close, volume, info FROM kline_un
             WHERE sid = ?1 AND timeframe = ?2",
            params![sid, tf],
            |row| {
                let start: i64 = row.get(0)?;
                Ok(UnfinishedBar {
                    sid,
                    start,
                    stop: row.get(1)?,
                    bar: Kline {
                        time: start,
                        open: row.get(2)?,
                        high: row.get(3)?,
                        low: row.get(4)?,
                        close: row.get(5)?,
                        volume: row.get(6)?,
                        info: row.get(7)?,
                    },
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn write_un(conn: &Connection, sid: i32, tf: &str, start: i64, stop: i64, bar: &Kline) -> Result<()> {
    conn.execute(
        "INSERT INTO kline_un (sid, timeframe, start_ms, stop_ms, open, high, low, close, volume, info)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(sid, timeframe) DO UPDATE SET
            start_ms = excluded.start_ms, stop_ms = excluded.stop_ms,
            open = excluded.open, high = excluded.high, low = excluded.low,
            close = excluded.close, volume = excluded.volume, info = excluded.info",
        params![sid, tf, start, stop, bar.open, bar.high, bar.low, bar.close, bar.volume, bar.info],
    )?;
    Ok(())
}

fn delete_un_before(conn: &Connection, sid: i32, tf: &str, before: i64) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM kline_un WHERE sid = ?1 AND timeframe = ?2 AND start_ms < ?3",
        params![sid, tf, before],
    )?)
}

/// 把一组K线合并为一根，时间设为 `bucket`
fn merge_rows(bucket: i64, rows: &[Kline]) -> Option<Kline> {
    let (first, rest) = rows.split_first()?;
    let mut bar = *first;
    bar.time = bucket;
    for r in rest {
        bar.merge(r);
    }
    Some(bar)
}

/// 写入已完成K线后更新更高周期的未完成K线
pub(crate) fn refresh_after_insert(
    conn: &Connection,
    sid: i32,
    st: &StoredTf,
    obs_start: i64,
    obs_end: i64,
    now_ms: i64,
) -> Result<()> {
    delete_un_before(conn, sid, st.tf, obs_end)?;

    for higher in STORED_TFS.iter().filter(|t| t.secs > st.secs) {
        let t_ms = higher.ms();
        if obs_end.rem_euclid(t_ms) == 0 {
            delete_un_before(conn, sid, higher.tf, obs_end)?;
            continue;
        }
        let bucket = align_tf_msecs(obs_end, t_ms);
        if bucket_end(bucket, t_ms) <= now_ms {
            // 历史数据，所在桶早已结束
            continue;
        }
        let old = read_un(conn, sid, higher.tf)?;
        if matches!(&old, Some(o) if o.start > bucket) {
            continue;
        }
        let bar = match old {
            Some(o) if o.start == bucket && o.stop == obs_start => {
                let rows = super::query::read_bars(conn, st, sid, obs_start, obs_end)?;
                let mut bar = o.bar;
                for r in &rows {
                    bar.merge(r);
                }
                Some(bar)
            }
            _ => {
                let rows = super::query::read_bars(conn, st, sid, bucket, obs_end)?;
                merge_rows(bucket, &rows)
            }
        };
        match bar {
            Some(bar) => write_un(conn, sid, higher.tf, bucket, obs_end, &bar)?,
            None => {
                delete_un_before(conn, sid, higher.tf, i64::MAX)?;
            }
        }
    }
    Ok(())
}

/// 组合当前桶的未完成K线：周期自身的行 + 其后已完成的1m + 1m 实时部分
pub(crate) fn compose_unfinished(conn: &Connection, sid: i32, tf_ms: i64, now_ms: i64) -> Result<Option<Kline>> {
    let bucket = align_tf_msecs(now_ms, tf_ms);
    let end = bucket_end(bucket, tf_ms);
    let mut bar: Option<Kline> = None;
    let mut cursor = bucket;

    let own_tf = STORED_TFS.iter().find(|s| s.ms() == tf_ms);
    if let Some(own) = own_tf {
        if let Some(row) = read_un(conn, sid, own.tf)? {
            if row.start == bucket {
                bar = Some(row.bar);
                cursor = row.stop.max(bucket);
            }
        }
    }

    if tf_ms > MINUTE_MS {
        let live_st = require_stored(LIVE_TF)?;
        let rows = super::query::read_bars(conn, live_st, sid, cursor, end)?;
        for r in &rows {
            match bar.as_mut() {
                Some(b) => b.merge(r),
                None => bar = merge_rows(bucket, std::slice::from_ref(r)),
            }
            cursor = r.time + MINUTE_MS;
        }
        if let Some(live) = read_un(conn, sid, LIVE_TF)? {
            if live.start >= cursor && live.start < end {
                match bar.as_mut() {
                    Some(b) => b.merge(&live.bar),
                    None => bar = merge_rows(bucket, std::slice::from_ref(&live.bar)),
                }
            }
        }
    }
    Ok(bar)
}

impl KlineStore {
    /// 保存实时推送的部分K线
    pub fn set_unfinished(&self, sid: i32, tf: &str, bar: &Kline, stop_ms: i64) -> Result<()> {
        let st = require_stored(tf)?;
        if bar.time.rem_euclid(st.ms()) != 0 {
            return Err(AppError::InvalidBar(format!("未完成K线未对齐: sid={} tf={} time={}", sid, tf, bar.time)));
        }
        let conn = self.conn()?;
        write_un(&conn, sid, tf, bar.time, stop_ms, bar)
    }

    /// 读取 (sid, tf) 当前桶的未完成K线
    pub fn get_unfinished(&self, sid: i32, tf: &str) -> Result<Option<Kline>> {
        let tf_ms = crate::klcommon::timeframe::tf_to_ms(tf)?;
        let conn = self.conn()?;
        compose_unfinished(&conn, sid, tf_ms, self.now_ms())
    }

    /// 原始的 kline_un 行
    pub fn get_unfinished_row(&self, sid: i32, tf: &str) -> Result<Option<UnfinishedBar>> {
        let conn = self.conn()?;
        read_un(&conn, sid, tf)
    }

    /// 删除所在桶已经结束的未完成K线，爬虫启动时调用
    pub fn purge_stale_unfinished(&self) -> Result<usize> {
        let now = self.now_ms();
        let conn = self.conn()?;
        let mut total = 0;
        for st in STORED_TFS {
            total += conn.execute(
                "DELETE FROM kline_un WHERE timeframe = ?1 AND start_ms < ?2",
                params![st.tf, align_tf_msecs(now, st.ms())],
            )?;
        }
        if total > 0 {
            info!(target: "klstore", purged = total, "已清理过期的未完成K线");
        } else {
            debug!(target: "klstore", "没有过期的未完成K线");
        }
        Ok(total)
    }
}
