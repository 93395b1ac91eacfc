//! 统一日志系统初始化模块
//!
//! 提供跨二进制文件的日志初始化：控制台输出、按天滚动的文件日志、问题摘要层。

use crate::klcommon::config::LoggingConfig;
use crate::klcommon::problem_summary::ProblemSummaryLayer;
use crate::klcommon::{AppError, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// 日志 guard，需要在 main 中持有到进程退出，否则文件日志会丢失尾部
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

fn build_filter(level: &str) -> EnvFilter {
    // 优先 RUST_LOG，回退到配置
    let base = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    EnvFilter::new(format!("{},hyper=warn,reqwest=warn,rusqlite=warn,tungstenite=warn", base))
}

/// 初始化日志系统
pub fn init_logging(config: &LoggingConfig, app_name: &str) -> Result<LoggingGuard> {
    let log_dir = Path::new(&config.log_dir);
    std::fs::create_dir_all(log_dir)
        .map_err(|e| AppError::ConfigError(format!("无法创建日志目录 {}: {}", config.log_dir, e)))?;

    let file_appender = tracing_appender::rolling::daily(log_dir, format!("{}.log", app_name));
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let file_layer = fmt::layer().with_writer(file_writer).with_ansi(false).with_target(true);
    if config.json_file {
        layers.push(file_layer.json().with_filter(build_filter(&config.log_level)).boxed());
    } else {
        layers.push(file_layer.with_filter(build_filter(&config.log_level)).boxed());
    }

    if config.enable_console_output {
        layers.push(
            fmt::layer()
                .with_target(false)
                .with_filter(build_filter(&config.log_level))
                .boxed(),
        );
    }

    let problem_layer = ProblemSummaryLayer::to_file(log_dir.join("problem_summary.log"))
        .map_err(|e| AppError::ConfigError(format!("无法创建问题摘要日志: {}", e)))?;
    layers.push(problem_layer.with_filter(EnvFilter::new("error")).boxed());

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| AppError::ConfigError(format!("日志系统初始化失败: {}", e)))?;

    tracing::info!(log_dir = %config.log_dir, level = %config.log_level, "日志系统初始化完成");
    Ok(LoggingGuard { _file_guard: file_guard })
}
