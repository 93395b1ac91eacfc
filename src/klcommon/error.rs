use thiserror::Error;
use std::net::AddrParseError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Time parsing error: {0}")]
    TimeParseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("SQLite error: {0}")]
    SqliteError(rusqlite::Error),

    /// 唯一键冲突，写入路径会在重置 kinfo 后重试一次
    #[error("Unique violation: {0}")]
    UniqueViolation(String),

    #[error("Invalid timeframe: {0}")]
    InvalidTimeframe(String),

    #[error("Invalid bar: {0}")]
    InvalidBar(String),

    /// 历史数据已读完，属于正常边界信号
    #[error("End of data: {0}")]
    Eof(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("URL parsing error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("Address parse error: {0}")]
    AddrParseError(#[from] AddrParseError),

    #[error("Protobuf decode error: {0}")]
    ProtoError(#[from] prost::DecodeError),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Unknown error: {0}")]
    #[allow(dead_code)]
    Unknown(String),
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            // 只有唯一键和主键冲突可以通过重置区间后重试修复
            rusqlite::Error::SqliteFailure(err, msg)
                if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
            {
                AppError::UniqueViolation(msg.clone().unwrap_or_else(|| err.to_string()))
            }
            _ => AppError::SqliteError(e),
        }
    }
}

impl From<r2d2::Error> for AppError {
    fn from(e: r2d2::Error) -> Self {
        AppError::DatabaseError(format!("获取数据库连接失败: {}", e))
    }
}

impl AppError {
    /// 获取错误类型的简洁摘要，用于日志中的 error.summary 字段
    ///
    /// 返回一个稳定的错误类别字符串，便于聚合统计
    pub fn get_error_type_summary(&self) -> &'static str {
        match self {
            // 行情数据获取
            AppError::ApiError(_) => "kline_data_acquisition_failed",
            AppError::HttpError(_) => "market_data_connection_failed",

            // 行情数据处理
            AppError::JsonError(_) => "kline_data_parsing_failed",
            AppError::DataError(_) => "kline_data_validation_failed",
            AppError::ProtoError(_) => "kline_bundle_decode_failed",
            AppError::InvalidTimeframe(_) => "kline_timeframe_invalid",
            AppError::InvalidBar(_) => "kline_bar_invalid",
            AppError::Eof(_) => "kline_history_exhausted",

            // 存储
            AppError::DatabaseError(_) => "kline_data_persistence_failed",
            AppError::SqliteError(_) => "kline_storage_operation_failed",
            AppError::UniqueViolation(_) => "kline_storage_unique_violation",

            // 实时连接
            AppError::WebSocketError(_) => "realtime_market_data_failed",
            AppError::UrlParseError(_) => "market_endpoint_invalid",
            AppError::AddrParseError(_) => "market_server_address_invalid",

            // 系统资源
            AppError::IoError(_) => "kline_file_operation_failed",
            AppError::ChannelError(_) => "kline_processing_pipeline_failed",
            AppError::Cancelled(_) => "kline_task_cancelled",

            AppError::TimeParseError(_) => "kline_timestamp_invalid",
            AppError::ConfigError(_) => "kline_service_configuration_invalid",

            AppError::Unknown(_) => "kline_service_unknown_error",
        }
    }

    /// 检查错误是否为可重试类型
    ///
    /// 下载器和连接获取路径据此决定是否重试
    pub fn is_retryable(&self) -> bool {
        match self {
            // 网络相关错误通常可重试
            AppError::HttpError(_) |
            AppError::ApiError(_) |
            AppError::WebSocketError(_) => true,

            AppError::IoError(_) |
            AppError::ChannelError(_) => true,

            AppError::DatabaseError(msg) => {
                msg.contains("locked") || msg.contains("busy") || msg.contains("timeout")
            },
            AppError::SqliteError(rusqlite::Error::SqliteFailure(err, _)) => {
                matches!(err.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
            },
            AppError::SqliteError(_) => false,

            // 唯一键冲突由写入路径单独修复一次
            AppError::UniqueViolation(_) => false,

            AppError::JsonError(_) |
            AppError::DataError(_) |
            AppError::ProtoError(_) |
            AppError::TimeParseError(_) |
            AppError::ConfigError(_) |
            AppError::UrlParseError(_) |
            AppError::AddrParseError(_) |
            AppError::InvalidTimeframe(_) |
            AppError::InvalidBar(_) |
            AppError::Eof(_) |
            AppError::Cancelled(_) => false,

            AppError::Unknown(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
