// K线下载器主程序：历史下载、缺口补全、数据包导入导出与诊断记录查看
use anyhow::Result;
use clap::{Parser, Subcommand};
use kline_hub::kldata::{BinanceExchange, Downloader};
use kline_hub::kldump::{decode_klines, DumpKind, DumpReader};
use kline_hub::klcommon::btime::{live_clock, parse_time_ms};
use kline_hub::klcommon::logging_setup::init_logging;
use kline_hub::klcommon::{AppConfig, ExSymbol};
use kline_hub::klstore::KlineStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Historical kline downloader and candle store maintenance tool.", long_about = None)]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download klines for the given symbols into the store.
    Download {
        #[arg(long, default_value = "binance")]
        exchange: String,
        #[arg(long, default_value = "linear")]
        market: String,
        /// Comma-separated symbols, e.g. "BTCUSDT,ETHUSDT".
        #[arg(short, long, value_delimiter = ',', required = true)]
        symbols: Vec<String>,
        #[arg(long, default_value = "1m")]
        tf: String,
        /// Start time: 20240101, 2024-01-01 08:00, 10-digit secs or 13-digit ms.
        #[arg(long)]
        start: String,
        /// End time, defaults to now.
        #[arg(long)]
        end: Option<String>,
    },
    /// Re-fetch holes that were not confirmed empty.
    FillHoles {
        #[arg(long, default_value = "binance")]
        exchange: String,
        #[arg(long, default_value = "linear")]
        market: String,
        #[arg(short, long, value_delimiter = ',', required = true)]
        symbols: Vec<String>,
        #[arg(long, default_value = "1m")]
        tf: String,
    },
    /// Export symbols and klines as a protobuf bundle.
    Export {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, default_value = "binance")]
        exchange: String,
        #[arg(long, default_value = "linear")]
        market: String,
        #[arg(short, long, value_delimiter = ',', required = true)]
        symbols: Vec<String>,
        #[arg(long, value_delimiter = ',', default_value = "1m,1h,1d")]
        tfs: Vec<String>,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
    },
    /// Import a bundle produced by `export`.
    Import {
        #[arg(long)]
        dir: PathBuf,
    },
    /// Print the rows of a dump file.
    Dump {
        file: PathBuf,
        /// Only print row headers, skip decoding klines.
        #[arg(long, default_value_t = false)]
        brief: bool,
    },
}

fn opt_time(text: &Option<String>) -> Result<i64> {
    Ok(match text {
        Some(t) => parse_time_ms(t)?,
        None => 0,
    })
}

fn open_store(config: &AppConfig) -> Result<KlineStore> {
    let store = KlineStore::open(&config.database.path, config.database.pool_size, live_clock())?;
    store.load_exsymbols()?;
    Ok(store)
}

fn resolve_symbols(store: &KlineStore, exchange: &str, market: &str, symbols: &[String]) -> Result<Vec<Arc<ExSymbol>>> {
    let items: Vec<ExSymbol> = symbols.iter().map(|s| ExSymbol::new_key(exchange, market, s)).collect();
    Ok(store.ensure_exsymbols(&items)?)
}

fn make_downloader(config: &AppConfig, store: KlineStore, exchange: &str, cancel: CancellationToken) -> Result<Downloader> {
    if exchange != "binance" {
        anyhow::bail!("不支持的交易所: {}", exchange);
    }
    let exg = Arc::new(BinanceExchange::new(&config.proxy)?);
    Ok(Downloader::new(store, exg, config.download.clone(), cancel))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = AppConfig::load_or_default(args.config.as_deref())?;
    let _guard = init_logging(&config.logging, "kline_downloader")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(target: "应用生命周期", reason = "received_ctrl_c", "接收到关闭信号，取消当前任务");
                cancel.cancel();
            }
        });
    }

    match args.command {
        Command::Download { exchange, market, symbols, tf, start, end } => {
            let store = open_store(&config)?;
            let items = resolve_symbols(&store, &exchange, &market, &symbols)?;
            let start_ms = parse_time_ms(&start)?;
            let end_ms = opt_time(&end)?;
            let downloader = make_downloader(&config, store, &exchange, cancel)?;
            let bars = downloader.bulk_down(&items, &tf, start_ms, end_ms).await?;
            info!(target: "应用生命周期", symbols = items.len(), tf = %tf, bars, "下载任务完成");
        }
        Command::FillHoles { exchange, market, symbols, tf } => {
            let store = open_store(&config)?;
            let items = resolve_symbols(&store, &exchange, &market, &symbols)?;
            let downloader = make_downloader(&config, store, &exchange, cancel)?;
            let mut total = 0;
            for exs in &items {
                total += downloader.fill_holes(exs, &tf).await?;
            }
            info!(target: "应用生命周期", symbols = items.len(), tf = %tf, bars = total, "缺口补全任务完成");
        }
        Command::Export { dir, exchange, market, symbols, tfs, start, end } => {
            let store = open_store(&config)?;
            let items = resolve_symbols(&store, &exchange, &market, &symbols)?;
            let sids: Vec<i32> = items.iter().map(|e| e.id).collect();
            let tf_refs: Vec<&str> = tfs.iter().map(|s| s.as_str()).collect();
            let stats = store.export_bundle(&dir, &sids, &tf_refs, opt_time(&start)?, opt_time(&end)?)?;
            info!(target: "应用生命周期", dir = %dir.display(), symbols = stats.symbols, blocks = stats.blocks, bars = stats.bars, files = stats.files, "导出完成");
        }
        Command::Import { dir } => {
            let store = open_store(&config)?;
            let stats = store.import_bundle(&dir)?;
            info!(target: "应用生命周期", dir = %dir.display(), symbols = stats.symbols, blocks = stats.blocks, bars = stats.bars, "导入完成");
        }
        Command::Dump { file, brief } => {
            let mut rows = 0usize;
            for row in DumpReader::open(&file)? {
                let row = row?;
                rows += 1;
                if row.kind == DumpKind::Kline && !brief {
                    let (symbol, tf, bars) = decode_klines(&row)?;
                    for bar in bars {
                        println!("{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}", row.time_ms, symbol, tf, bar.time, bar.open, bar.high, bar.low, bar.close, bar.volume);
                    }
                } else {
                    println!("{}\t{:?}\t{}\t{} bytes", row.time_ms, row.kind, row.key, row.val.len());
                }
            }
            info!(target: "应用生命周期", file = %file.display(), rows, "诊断记录读取完成");
        }
    }
    Ok(())
}
