//! 服务配置模块

use serde::{Deserialize, Serialize};
use crate::klcommon::{AppError, Result};
use std::path::Path;

/// 系统配置常量
pub mod constants {
    /// 默认配置文件路径
    pub const DEFAULT_CONFIG_PATH: &str = "config/KlineHubConfig.toml";

    /// Spider 默认监听地址
    pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:6789";

    /// 默认写入协程数
    pub const DEFAULT_WRITE_WORKERS: usize = 5;

    /// 默认写入队列容量
    pub const DEFAULT_WRITE_QUEUE_SIZE: usize = 5000;

    /// 单次 REST 请求的K线数量
    pub const DEFAULT_BATCH_SIZE: usize = 1000;

    /// 批量下载并发数
    pub const DEFAULT_CONCUR_NUM: usize = 2;

    /// 回放缓存的K线数量
    pub const DEFAULT_REPLAY_BATCH: usize = 3000;
}

use constants::*;

fn default_db_path() -> String {
    "kline_hub.db".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn default_write_workers() -> usize {
    DEFAULT_WRITE_WORKERS
}

fn default_write_queue_size() -> usize {
    DEFAULT_WRITE_QUEUE_SIZE
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_concur_num() -> usize {
    DEFAULT_CONCUR_NUM
}

fn default_max_retries() -> usize {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_true() -> bool {
    true
}

fn default_replay_batch() -> usize {
    DEFAULT_REPLAY_BATCH
}

fn default_proxy_url() -> String {
    "socks5://127.0.0.1:1080".to_string()
}

/// 完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub spider: SpiderConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// 数据库文件路径
    #[serde(default = "default_db_path")]
    pub path: String,

    /// 连接池大小
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

/// 单个交易所的订阅市场
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub name: String,
    pub markets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpiderConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// 写入协程数量，按 sid 分片
    #[serde(default = "default_write_workers")]
    pub write_workers: usize,

    #[serde(default = "default_write_queue_size")]
    pub write_queue_size: usize,

    #[serde(default)]
    pub exchanges: Vec<ExchangeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_concur_num")]
    pub concur_num: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// 可重试错误的最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别 (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// 是否输出到控制台
    #[serde(default = "default_true")]
    pub enable_console_output: bool,

    /// 是否以 JSON 格式写文件日志
    #[serde(default)]
    pub json_file: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub enabled: bool,

    /// 例如 socks5://127.0.0.1:1080
    #[serde(default = "default_proxy_url")]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// 交易对刷新的 cron 表达式（含秒字段），为空表示不刷新
    #[serde(default)]
    pub refresh_cron: Option<String>,

    #[serde(default = "default_replay_batch")]
    pub batch_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path(), pool_size: default_pool_size() }
    }
}

impl Default for SpiderConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            write_workers: DEFAULT_WRITE_WORKERS,
            write_queue_size: DEFAULT_WRITE_QUEUE_SIZE,
            exchanges: vec![ExchangeConfig {
                name: "binance".to_string(),
                markets: vec!["spot".to_string(), "linear".to_string()],
            }],
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concur_num: DEFAULT_CONCUR_NUM,
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: default_max_retries(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            enable_console_output: true,
            json_file: false,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self { enabled: false, url: default_proxy_url() }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self { refresh_cron: None, batch_size: DEFAULT_REPLAY_BATCH }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::ConfigError(format!("解析配置文件失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 文件不存在时使用默认配置；存在但无效时报错
    pub fn load_or_default(path: Option<&str>) -> Result<Self> {
        let path = path
            .map(|p| p.to_string())
            .or_else(|| std::env::var("CONFIG_PATH").ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        if Path::new(&path).exists() {
            Self::from_file(&path)
        } else {
            tracing::warn!(config_path = %path, "配置文件不存在，使用默认配置");
            Ok(Self::default())
        }
    }

    /// 保存配置到文件
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| AppError::ConfigError(format!("序列化配置失败: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.database.pool_size == 0 {
            return Err(AppError::ConfigError("数据库连接池大小必须大于0".to_string()));
        }
        if self.spider.write_workers == 0 {
            return Err(AppError::ConfigError("写入协程数必须大于0".to_string()));
        }
        if self.spider.write_queue_size == 0 {
            return Err(AppError::ConfigError("写入队列大小必须大于0".to_string()));
        }
        if self.download.batch_size == 0 || self.download.concur_num == 0 {
            return Err(AppError::ConfigError("下载批大小与并发数必须大于0".to_string()));
        }
        if let Some(expr) = &self.replay.refresh_cron {
            crate::klfeed::refresh::RefreshSchedule::parse(expr)?;
        }
        Ok(())
    }
}
