//! 按 key 计数的退避等待
//!
//! Spider 用它决定掉线的订阅何时可以重新尝试；Watcher 用它控制重连节奏。

use crate::klcommon::btime::ClockRef;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// 默认等待序列：3s, 6s, 12s, 30s
pub const DEFAULT_WAITS_MS: &[i64] = &[3000, 6000, 12000, 30000];

#[derive(Debug, Clone, Copy, Default)]
struct FailState {
    count: usize,
    next_ms: i64,
}

#[derive(Debug)]
pub struct RetryWaits {
    waits_ms: Vec<i64>,
    clock: ClockRef,
    states: Mutex<HashMap<String, FailState>>,
}

impl RetryWaits {
    pub fn new(clock: ClockRef) -> Self {
        Self::with_waits(clock, DEFAULT_WAITS_MS.to_vec(), 1.0)
    }

    /// 自定义等待序列，`rate` 对所有等待时长做缩放
    pub fn with_waits(clock: ClockRef, waits_ms: Vec<i64>, rate: f64) -> Self {
        let waits_ms = if waits_ms.is_empty() { DEFAULT_WAITS_MS.to_vec() } else { waits_ms };
        let waits_ms = waits_ms
            .into_iter()
            .map(|w| ((w as f64) * rate).round() as i64)
            .collect();
        Self { waits_ms, clock, states: Mutex::new(HashMap::new()) }
    }

    /// 记录一次失败，返回下次允许重试的时间
    pub fn set_fail(&self, key: &str) -> i64 {
        let now = self.clock.now_ms();
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let state = states.entry(key.to_string()).or_default();
        state.count += 1;
        let idx = (state.count - 1).min(self.waits_ms.len() - 1);
        state.next_ms = now + self.waits_ms[idx];
        tracing::debug!(decision = "retry_scheduled", key = %key, fail_count = state.count, next_ms = state.next_ms, "记录失败并安排重试");
        state.next_ms
    }

    /// 计划的重试时间，没有待重试时返回 0
    pub fn next_retry(&self, key: &str) -> i64 {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.get(key).map(|s| s.next_ms).unwrap_or(0)
    }

    /// 距离下次重试的等待时长
    pub fn wait_duration(&self, key: &str) -> Duration {
        let next = self.next_retry(key);
        let left = next - self.clock.now_ms();
        Duration::from_millis(left.max(0) as u64)
    }

    pub fn fail_count(&self, key: &str) -> usize {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.get(key).map(|s| s.count).unwrap_or(0)
    }

    pub fn reset(&self, key: &str) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.remove(key);
    }
}
