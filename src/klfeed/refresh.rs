//! 交易对定时刷新
//!
//! 表达式为带秒字段的 cron 语法，在回放中按模拟时间求值，实盘中按系统时间。

use crate::klcommon::{AppError, ClockRef, Result};
use chrono::{TimeZone, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct RefreshSchedule {
    expr: String,
    schedule: Schedule,
}

impl RefreshSchedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let schedule = Schedule::from_str(expr)
            .map_err(|e| AppError::ConfigError(format!("无效的刷新 cron 表达式 {:?}: {}", expr, e)))?;
        Ok(Self { expr: expr.to_string(), schedule })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// 严格晚于 ms 的下一次触发时间
    pub fn next_after(&self, ms: i64) -> Option<i64> {
        let at = Utc.timestamp_millis_opt(ms).single()?;
        self.schedule.after(&at).next().map(|t| t.timestamp_millis())
    }
}

/// 实盘刷新任务：每次到点向 dirty 通道发送递增版本号
pub async fn run_live_refresh(
    schedule: RefreshSchedule,
    clock: ClockRef,
    dirty: mpsc::UnboundedSender<i64>,
    cancel: CancellationToken,
) {
    let mut version = 0i64;
    info!(target: "klfeed", log_type = "module", cron = schedule.expr(), "交易对刷新任务已启动");
    loop {
        let now = clock.now_ms();
        let Some(next) = schedule.next_after(now) else { return };
        let wait = Duration::from_millis((next - now).max(0) as u64);
        if !crate::klcommon::btime::sleep(wait, &cancel).await {
            return;
        }
        version += 1;
        debug!(target: "klfeed", version, "触发交易对刷新");
        if dirty.send(version).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_after_every_hour() {
        let sch = RefreshSchedule::parse("0 0 * * * *").unwrap();
        assert_eq!(sch.next_after(0), Some(3_600_000));
        assert_eq!(sch.next_after(3_600_000), Some(7_200_000));
        assert_eq!(sch.next_after(3_599_999), Some(3_600_000));
    }

    #[test]
    fn test_invalid_expr() {
        let err = RefreshSchedule::parse("not a cron").unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }
}
