//! 表结构初始化

use crate::klcommon::timeframe::STORED_TFS;
use crate::klcommon::Result;
use rusqlite::Connection;
use tracing::debug;

const BASE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS exsymbol (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exchange TEXT NOT NULL,
    exg_real TEXT NOT NULL,
    market TEXT NOT NULL,
    symbol TEXT NOT NULL,
    combined INTEGER NOT NULL DEFAULT 0,
    list_ms INTEGER NOT NULL DEFAULT 0,
    delist_ms INTEGER NOT NULL DEFAULT 0,
    UNIQUE (exchange, market, symbol)
);
CREATE TABLE IF NOT EXISTS kinfo (
    sid INTEGER NOT NULL,
    timeframe TEXT NOT NULL,
    start INTEGER NOT NULL,
    stop INTEGER NOT NULL,
    PRIMARY KEY (sid, timeframe)
);
CREATE TABLE IF NOT EXISTS khole (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sid INTEGER NOT NULL,
    timeframe TEXT NOT NULL,
    start INTEGER NOT NULL,
    stop INTEGER NOT NULL,
    no_data INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_khole_sid_tf ON khole (sid, timeframe, start);
CREATE TABLE IF NOT EXISTS kline_un (
    sid INTEGER NOT NULL,
    timeframe TEXT NOT NULL,
    start_ms INTEGER NOT NULL,
    stop_ms INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    info REAL NOT NULL DEFAULT 0,
    PRIMARY KEY (sid, timeframe)
);
CREATE TABLE IF NOT EXISTS adj_factors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sid INTEGER NOT NULL,
    sub_id INTEGER NOT NULL,
    start_ms INTEGER NOT NULL,
    factor REAL NOT NULL,
    UNIQUE (sid, start_ms)
);
CREATE TABLE IF NOT EXISTS calendars (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    start_ms INTEGER NOT NULL,
    stop_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_calendars_name ON calendars (name, start_ms);
";

/// 创建全部表（幂等）
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(BASE_SCHEMA)?;
    for st in STORED_TFS {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                sid INTEGER NOT NULL,
                time INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                info REAL NOT NULL DEFAULT 0,
                PRIMARY KEY (sid, time)
            ) WITHOUT ROWID",
            st.table()
        );
        conn.execute(&sql, [])?;
    }
    debug!(target: "klstore", decision = "schema_ready", tables = STORED_TFS.len() + 6, "表结构已就绪");
    Ok(())
}
