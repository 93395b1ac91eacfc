// 爬虫服务主程序：订阅交易所行情、写库并向客户端广播
use anyhow::Result;
use clap::Parser;
use kline_hub::kldata::{BinanceExchange, ExchangeRef};
use kline_hub::klcommon::btime::live_clock;
use kline_hub::klcommon::logging_setup::init_logging;
use kline_hub::klcommon::AppConfig;
use kline_hub::klspider::Spider;
use kline_hub::klstore::KlineStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Market-data spider: streams exchange data into the candle store and fans it out to clients.", long_about = None)]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long)]
    config: Option<String>,

    /// Override the listen address from the config file.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = AppConfig::load_or_default(args.config.as_deref())?;
    let _guard = init_logging(&config.logging, "kline_spider")?;

    let clock = live_clock();
    let store = KlineStore::open(&config.database.path, config.database.pool_size, clock.clone())?;
    let loaded = store.load_exsymbols()?;
    info!(target: "应用生命周期", log_type = "low_freq", symbols = loaded, db = %config.database.path, "K线库已打开");

    let mut exchanges: Vec<ExchangeRef> = Vec::new();
    for exg in &config.spider.exchanges {
        match exg.name.as_str() {
            "binance" => exchanges.push(Arc::new(BinanceExchange::new(&config.proxy)?)),
            other => warn!(target: "应用生命周期", exchange = other, "不支持的交易所，已跳过"),
        }
    }

    let cancel = CancellationToken::new();
    let spider = Spider::new(&config.spider, store, exchanges, clock, cancel.clone()).await?;
    let listen = args.listen.unwrap_or_else(|| config.spider.listen_addr.clone());
    let server = tokio::spawn(spider.serve(listen));

    tokio::signal::ctrl_c().await?;
    info!(target: "应用生命周期", log_type = "low_freq", reason = "received_ctrl_c", "接收到关闭信号，开始优雅关闭");
    cancel.cancel();
    match server.await {
        Ok(Ok(())) => info!(target: "应用生命周期", "爬虫服务已退出"),
        Ok(Err(e)) => error!(target: "应用生命周期", log_type = "low_freq", error.summary = e.get_error_type_summary(), error.details = %e, "爬虫服务异常退出"),
        Err(e) => error!(target: "应用生命周期", log_type = "low_freq", error.details = %e, "爬虫任务异常结束"),
    }
    Ok(())
}
