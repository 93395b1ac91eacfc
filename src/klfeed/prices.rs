//! 最新价格缓存
//!
//! `prices` 来自爬虫的价格推送，`bar_prices` 来自K线收盘价；查询时优先推送价格。

use crate::klcommon::PriceMap;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct PriceCache {
    prices: RwLock<HashMap<String, f64>>,
    bar_prices: RwLock<HashMap<String, f64>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_prices(&self, prices: &PriceMap) {
        let mut guard = self.prices.write().unwrap_or_else(|e| e.into_inner());
        for (sym, price) in prices {
            guard.insert(sym.clone(), *price);
        }
    }

    pub fn set_bar_price(&self, symbol: &str, price: f64) {
        self.bar_prices
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(symbol.to_string(), price);
    }

    pub fn get_price(&self, symbol: &str) -> Option<f64> {
        if let Some(p) = self.prices.read().unwrap_or_else(|e| e.into_inner()).get(symbol) {
            return Some(*p);
        }
        self.bar_prices.read().unwrap_or_else(|e| e.into_inner()).get(symbol).copied()
    }

    /// 回放开始前清空
    pub fn clear(&self) {
        self.prices.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.bar_prices.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
