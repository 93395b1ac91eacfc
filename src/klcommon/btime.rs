//! 时间基准：实盘使用系统 UTC 时间，回放使用由调度器推进的模拟时间

use crate::klcommon::{AppError, Result};
use chrono::{TimeZone, Utc};
use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 时间源能力，通过构造函数注入到 Feeder / Provider / 存储层
pub trait Clock: Send + Sync + Debug {
    /// 当前毫秒时间戳
    fn now_ms(&self) -> i64;

    /// 是否为实盘时间
    fn is_live(&self) -> bool;
}

pub type ClockRef = Arc<dyn Clock>;

pub fn utc_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LiveClock;

impl Clock for LiveClock {
    fn now_ms(&self) -> i64 {
        utc_ms()
    }

    fn is_live(&self) -> bool {
        true
    }
}

/// 回放时钟，只由回放任务写入
#[derive(Debug, Default)]
pub struct SimClock {
    cur_ms: AtomicI64,
}

impl SimClock {
    pub fn new(start_ms: i64) -> Self {
        Self { cur_ms: AtomicI64::new(start_ms) }
    }

    pub fn set(&self, ms: i64) {
        self.cur_ms.store(ms, Ordering::Release);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.cur_ms.fetch_add(delta_ms, Ordering::AcqRel);
    }
}

impl Clock for SimClock {
    fn now_ms(&self) -> i64 {
        self.cur_ms.load(Ordering::Acquire)
    }

    fn is_live(&self) -> bool {
        false
    }
}

pub fn live_clock() -> ClockRef {
    Arc::new(LiveClock)
}

/// 可取消的等待；返回 false 表示被取消
pub async fn sleep(d: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(d) => true,
        _ = cancel.cancelled() => false,
    }
}

fn build_ms(parts: &[u32]) -> Option<i64> {
    let year = *parts.first()? as i32;
    let month = parts.get(1).copied().unwrap_or(1);
    let day = parts.get(2).copied().unwrap_or(1);
    let hour = parts.get(3).copied().unwrap_or(0);
    let minute = parts.get(4).copied().unwrap_or(0);
    let second = parts.get(5).copied().unwrap_or(0);
    Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()
        .map(|dt| dt.timestamp_millis())
}

fn split_fixed(digits: &str, widths: &[usize]) -> Option<Vec<u32>> {
    let mut out = Vec::with_capacity(widths.len());
    let mut pos = 0;
    for w in widths {
        out.push(digits.get(pos..pos + w)?.parse().ok()?);
        pos += w;
    }
    Some(out)
}

/// 解析多种格式的时间字符串为毫秒时间戳（UTC）
///
/// 支持：YYYY、YYYYMM、YYYYMMDD（可用 `-` `/` `.` 或空格分隔）、
/// YYYYMMDDHHmm、YYYYMMDDHHmmss（时间部分可用 `:` 分隔）、10位秒和13位毫秒时间戳。
pub fn parse_time_ms(text: &str) -> Result<i64> {
    let s = text.trim();
    let err = || AppError::TimeParseError(format!("无法识别的时间格式: {}", text));
    if s.is_empty() {
        return Err(err());
    }
    if s.chars().all(|c| c.is_ascii_digit()) {
        let parts = match s.len() {
            4 => split_fixed(s, &[4]),
            6 => split_fixed(s, &[4, 2]),
            8 => split_fixed(s, &[4, 2, 2]),
            10 => return s.parse::<i64>().map(|v| v * 1000).map_err(|_| err()),
            12 => split_fixed(s, &[4, 2, 2, 2, 2]),
            13 => return s.parse::<i64>().map_err(|_| err()),
            14 => split_fixed(s, &[4, 2, 2, 2, 2, 2]),
            _ => None,
        };
        return parts.as_deref().and_then(build_ms).ok_or_else(err);
    }

    // 带分隔符：日期部分用 - / . 或空格，时间部分用 :
    let (date_part, time_part) = match s.rfind(|c: char| c == ' ' || c == 'T') {
        Some(idx) if s[idx + 1..].contains(':') => (&s[..idx], Some(s[idx + 1..].trim())),
        _ => (s, None),
    };
    let mut parts: Vec<u32> = Vec::new();
    for (i, seg) in date_part.split(|c| matches!(c, '-' | '/' | '.' | ' ')).enumerate() {
        let valid = if i == 0 { seg.len() == 4 } else { (1..=2).contains(&seg.len()) };
        if !valid || !seg.chars().all(|c| c.is_ascii_digit()) {
            return Err(err());
        }
        parts.push(seg.parse().map_err(|_| err())?);
    }
    if parts.len() > 3 {
        return Err(err());
    }
    if let Some(tp) = time_part {
        if parts.len() != 3 {
            return Err(err());
        }
        let segs: Vec<&str> = tp.split(':').collect();
        if segs.len() < 2 || segs.len() > 3 {
            return Err(err());
        }
        for seg in segs {
            if !(1..=2).contains(&seg.len()) || !seg.chars().all(|c| c.is_ascii_digit()) {
                return Err(err());
            }
            parts.push(seg.parse().map_err(|_| err())?);
        }
    }
    build_ms(&parts).ok_or_else(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_formats() {
        let day = 1704067200000; // 2024-01-01
        assert_eq!(parse_time_ms("2024").unwrap(), day);
        assert_eq!(parse_time_ms("202401").unwrap(), day);
        assert_eq!(parse_time_ms("20240101").unwrap(), day);
        assert_eq!(parse_time_ms("2024-01-01").unwrap(), day);
        assert_eq!(parse_time_ms("2024/01/01").unwrap(), day);
        assert_eq!(parse_time_ms("2024.1.1").unwrap(), day);
        assert_eq!(parse_time_ms("2024 01 01").unwrap(), day);
        assert_eq!(parse_time_ms("202401010130").unwrap(), day + 90 * 60_000);
        assert_eq!(parse_time_ms("20240101013005").unwrap(), day + 90 * 60_000 + 5000);
        assert_eq!(parse_time_ms("2024-01-01 01:30").unwrap(), day + 90 * 60_000);
        assert_eq!(parse_time_ms("2024-01-01 01:30:05").unwrap(), day + 90 * 60_000 + 5000);
        assert_eq!(parse_time_ms("1704067200").unwrap(), day);
        assert_eq!(parse_time_ms("1704067200000").unwrap(), day);
    }

    #[test]
    fn test_parse_time_rejects_garbage() {
        for bad in ["", "24", "2024-13-01", "abc", "12345", "2024-01-01-02", "2024_01"] {
            assert!(parse_time_ms(bad).is_err(), "应拒绝: {}", bad);
        }
    }

    #[test]
    fn test_sim_clock() {
        let clock = SimClock::new(1000);
        assert_eq!(clock.now_ms(), 1000);
        clock.set(5000);
        clock.advance(60);
        assert_eq!(clock.now_ms(), 5060);
        assert!(!clock.is_live());
    }

    #[tokio::test]
    async fn test_sleep_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!sleep(Duration::from_secs(30), &cancel).await);
    }
}
