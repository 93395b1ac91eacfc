//! 周期换算与时间对齐
//!
//! 所有周期都以秒为基本单位；周线按周一 00:00 UTC 对齐，月线按自然月对齐。

use crate::klcommon::{AppError, Result};
use chrono::{Datelike, TimeZone, Utc};

pub const SECOND_MS: i64 = 1000;
pub const MINUTE_MS: i64 = 60 * SECOND_MS;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;
pub const WEEK_MS: i64 = 7 * DAY_MS;
/// "1M" 按 30 天换算秒数，对齐时按自然月处理
pub const MONTH_MS: i64 = 30 * DAY_MS;

/// 1970-01-01 是周四，+3天后按周取整再减回，即对齐到周一
pub const MONDAY_ALIGNMENT_OFFSET_MS: i64 = 3 * DAY_MS;

/// 持久化的K线周期及其连续聚合来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredTf {
    pub tf: &'static str,
    pub secs: i64,
    pub agg_from: Option<&'static str>,
}

impl StoredTf {
    pub fn ms(&self) -> i64 {
        self.secs * 1000
    }

    pub fn table(&self) -> String {
        format!("kline_{}", self.tf)
    }
}

/// 按周期升序
pub const STORED_TFS: &[StoredTf] = &[
    StoredTf { tf: "1m", secs: 60, agg_from: None },
    StoredTf { tf: "5m", secs: 300, agg_from: Some("1m") },
    StoredTf { tf: "15m", secs: 900, agg_from: Some("5m") },
    StoredTf { tf: "1h", secs: 3600, agg_from: Some("15m") },
    StoredTf { tf: "1d", secs: 86400, agg_from: Some("1h") },
];

/// 可直接从交易所下载的周期，降序
const DOWN_TFS: &[(&str, i64)] = &[("1d", 86400), ("1h", 3600), ("15m", 900), ("1m", 60)];

/// 将周期字符串转换为秒，例如 "1m" -> 60, "4h" -> 14400
pub fn tf_to_secs(tf: &str) -> Result<i64> {
    let tf = tf.trim();
    if tf.len() < 2 {
        return Err(AppError::InvalidTimeframe(tf.to_string()));
    }
    let (num, unit) = tf.split_at(tf.len() - 1);
    let value: i64 = num
        .parse()
        .map_err(|_| AppError::InvalidTimeframe(tf.to_string()))?;
    if value <= 0 {
        return Err(AppError::InvalidTimeframe(tf.to_string()));
    }
    let unit_secs = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        "w" => 7 * 86400,
        "M" => 30 * 86400,
        _ => return Err(AppError::InvalidTimeframe(tf.to_string())),
    };
    Ok(value * unit_secs)
}

pub fn tf_to_ms(tf: &str) -> Result<i64> {
    Ok(tf_to_secs(tf)? * 1000)
}

/// 秒数转换为最简周期字符串
pub fn secs_to_tf(secs: i64) -> String {
    if secs >= MONTH_MS / 1000 && secs % (MONTH_MS / 1000) == 0 {
        return format!("{}M", secs / (MONTH_MS / 1000));
    }
    for (unit, size) in [("w", 7 * 86400), ("d", 86400), ("h", 3600), ("m", 60)] {
        if secs >= size && secs % size == 0 {
            return format!("{}{}", secs / size, unit);
        }
    }
    format!("{}s", secs)
}

fn is_month_tf(tf_ms: i64) -> bool {
    tf_ms >= MONTH_MS && tf_ms % MONTH_MS == 0
}

fn is_week_tf(tf_ms: i64) -> bool {
    !is_month_tf(tf_ms) && tf_ms >= WEEK_MS && tf_ms % WEEK_MS == 0
}

fn month_index(time_ms: i64) -> i64 {
    let dt = Utc.timestamp_millis_opt(time_ms).single().unwrap_or_default();
    (dt.year() as i64 - 1970) * 12 + dt.month0() as i64
}

fn month_index_to_ms(idx: i64) -> i64 {
    let year = 1970 + idx.div_euclid(12);
    let month = idx.rem_euclid(12) as u32 + 1;
    Utc.with_ymd_and_hms(year as i32, month, 1, 0, 0, 0)
        .single()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0)
}

/// 将时间戳向下对齐到周期桶的开始
pub fn align_tf_msecs(time_ms: i64, tf_ms: i64) -> i64 {
    if tf_ms <= 0 {
        return time_ms;
    }
    if is_month_tf(tf_ms) {
        let n = tf_ms / MONTH_MS;
        let idx = month_index(time_ms);
        return month_index_to_ms(idx - idx.rem_euclid(n));
    }
    if is_week_tf(tf_ms) {
        return (time_ms + MONDAY_ALIGNMENT_OFFSET_MS).div_euclid(tf_ms) * tf_ms - MONDAY_ALIGNMENT_OFFSET_MS;
    }
    time_ms.div_euclid(tf_ms) * tf_ms
}

/// 桶的结束时间（不含）
pub fn bucket_end(bucket_start: i64, tf_ms: i64) -> i64 {
    if is_month_tf(tf_ms) {
        let n = tf_ms / MONTH_MS;
        return month_index_to_ms(month_index(bucket_start) + n);
    }
    bucket_start + tf_ms
}

/// 向上对齐
pub fn align_up(time_ms: i64, tf_ms: i64) -> i64 {
    let down = align_tf_msecs(time_ms, tf_ms);
    if down == time_ms {
        down
    } else {
        bucket_end(down, tf_ms)
    }
}

pub fn stored_tf(tf: &str) -> Option<&'static StoredTf> {
    STORED_TFS.iter().find(|s| s.tf == tf)
}

pub fn stored_tf_by_secs(secs: i64) -> Option<&'static StoredTf> {
    STORED_TFS.iter().find(|s| s.secs == secs)
}

/// 以 tf 为来源的更高一级连续聚合周期
pub fn agg_targets(tf: &str) -> impl Iterator<Item = &'static StoredTf> + '_ {
    STORED_TFS.iter().filter(move |s| s.agg_from == Some(tf))
}

/// 为任意周期选择用于查询/聚合的持久化周期：能整除它的最大持久化周期
pub fn get_query_tf(tf_secs: i64) -> Result<&'static StoredTf> {
    if let Some(s) = stored_tf_by_secs(tf_secs) {
        return Ok(s);
    }
    let tf_ms = tf_secs * 1000;
    // 周线/月线的桶边界不在 epoch 网格上，只能从日线聚合
    if is_month_tf(tf_ms) || is_week_tf(tf_ms) {
        return stored_tf("1d").ok_or_else(|| AppError::InvalidTimeframe(secs_to_tf(tf_secs)));
    }
    STORED_TFS
        .iter()
        .rev()
        .find(|s| s.secs < tf_secs && tf_secs % s.secs == 0)
        .ok_or_else(|| AppError::InvalidTimeframe(secs_to_tf(tf_secs)))
}

/// 下载周期路由：{1m, 15m, 1h, 1d} 中能整除 tf 的最大者
///
/// 1m 只服务于能整除一小时的分钟周期，否则聚合出的桶无法与小时边界对齐。
pub fn get_down_tf(tf: &str) -> Result<&'static str> {
    let secs = tf_to_secs(tf)?;
    if secs < 60 {
        return Err(AppError::InvalidTimeframe(tf.to_string()));
    }
    let tf_ms = secs * 1000;
    if is_month_tf(tf_ms) || is_week_tf(tf_ms) {
        return Ok("1d");
    }
    for (down, down_secs) in DOWN_TFS {
        if secs % down_secs != 0 {
            continue;
        }
        if *down == "1m" && secs < 3600 && 3600 % secs != 0 {
            break;
        }
        return Ok(down);
    }
    Err(AppError::InvalidTimeframe(tf.to_string()))
}

pub fn gcd(a: i64, b: i64) -> i64 {
    if b == 0 { a.abs() } else { gcd(b, a % b) }
}

pub fn gcd_all(values: impl IntoIterator<Item = i64>) -> i64 {
    values.into_iter().fold(0, gcd)
}
