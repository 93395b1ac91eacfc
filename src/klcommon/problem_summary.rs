//! 问题摘要层
//!
//! 捕获 ERROR 级别事件写入问题摘要文件。60 秒窗口内相同的错误只通知一次，
//! 窗口结束后的下一次出现会附带被合并的次数。

use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::Write;
use std::sync::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::{layer::Context, registry::LookupSpan, Layer};

/// 相同错误的合并窗口
pub const COALESCE_WINDOW_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy)]
struct SeenError {
    window_start: i64,
    suppressed: usize,
}

/// 一条需要发出的通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub key: String,
    /// 上一个窗口中被合并掉的次数
    pub suppressed: usize,
}

/// 按 key 做时间窗口合并，不依赖 tracing，便于单独测试
#[derive(Debug, Default)]
pub struct ErrorCoalescer {
    window_ms: i64,
    seen: HashMap<String, SeenError>,
}

impl ErrorCoalescer {
    pub fn new(window_ms: i64) -> Self {
        Self { window_ms, seen: HashMap::new() }
    }

    /// 记录一次出现；需要通知时返回 Some
    pub fn observe(&mut self, key: &str, now_ms: i64) -> Option<Notice> {
        match self.seen.get_mut(key) {
            Some(seen) if now_ms - seen.window_start < self.window_ms => {
                seen.suppressed += 1;
                None
            }
            Some(seen) => {
                let suppressed = seen.suppressed;
                *seen = SeenError { window_start: now_ms, suppressed: 0 };
                Some(Notice { key: key.to_string(), suppressed })
            }
            None => {
                // 防止 key 无限增长
                if self.seen.len() > 4096 {
                    let window = self.window_ms;
                    self.seen.retain(|_, s| now_ms - s.window_start < window);
                }
                self.seen.insert(key.to_string(), SeenError { window_start: now_ms, suppressed: 0 });
                Some(Notice { key: key.to_string(), suppressed: 0 })
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ProblemSummary<'a> {
    timestamp: String,
    level: &'a str,
    target: &'a str,
    message: &'a str,
    fields: &'a str,
    repeated: usize,
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    fields: String,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, "{}={} ", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, "{}={:?} ", field.name(), value);
        }
    }
}

/// 问题摘要层 - 只关心错误
pub struct ProblemSummaryLayer {
    coalescer: Mutex<ErrorCoalescer>,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl ProblemSummaryLayer {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            coalescer: Mutex::new(ErrorCoalescer::new(COALESCE_WINDOW_MS)),
            writer: Mutex::new(writer),
        }
    }

    /// 追加写入指定文件
    pub fn to_file<P: AsRef<std::path::Path>>(path: P) -> std::io::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(Box::new(std::io::BufWriter::new(file))))
    }
}

impl<S> Layer<S> for ProblemSummaryLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() != tracing::Level::ERROR {
            return;
        }
        let mut collector = FieldCollector::default();
        event.record(&mut collector);

        // 同一位置的同一消息视为相同错误
        let key = format!("{}|{}|{}", metadata.target(), metadata.line().unwrap_or(0), collector.message);
        let now = chrono::Utc::now();
        let notice = {
            let mut coalescer = self.coalescer.lock().unwrap_or_else(|e| e.into_inner());
            coalescer.observe(&key, now.timestamp_millis())
        };
        let Some(notice) = notice else {
            return;
        };

        let summary = ProblemSummary {
            timestamp: now.to_rfc3339(),
            level: metadata.level().as_str(),
            target: metadata.target(),
            message: &collector.message,
            fields: collector.fields.trim_end(),
            repeated: notice.suppressed,
        };
        if let Ok(json) = serde_json::to_string(&summary) {
            let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
            if writeln!(writer, "{}", json).is_ok() {
                let _ = writer.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalesce_within_window() {
        let mut c = ErrorCoalescer::new(COALESCE_WINDOW_MS);
        assert_eq!(c.observe("db", 0), Some(Notice { key: "db".into(), suppressed: 0 }));
        assert_eq!(c.observe("db", 1_000), None);
        assert_eq!(c.observe("db", 59_999), None);
        assert!(c.observe("ws", 30_000).is_some(), "不同错误互不影响");
        // 窗口过后再次通知，并带上被合并的次数
        assert_eq!(c.observe("db", 60_000), Some(Notice { key: "db".into(), suppressed: 2 }));
        assert_eq!(c.observe("db", 60_500), None);
    }
}
