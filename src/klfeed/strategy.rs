//! 策略接口：K线回调、下单请求和订单出口
//!
//! 策略在 `on_bar` 里把开平仓请求追加到 `StratJob` 上，运行器按开关过滤后交给 [`OrderSink`]。
//! 预热阶段产生的请求只用于更新策略内部状态，不会下发。

use super::feeder::BarHandler;
use crate::klcommon::{AppError, Kline, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    #[default]
    Market,
    Limit,
    /// 只挂单
    PostOnly,
}

/// 开仓请求
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EnterReq {
    pub tag: String,
    pub short: bool,
    /// 限价，0 表示市价
    pub limit: f64,
    /// 相对默认开仓金额的倍率
    pub cost_rate: f64,
    /// 法币计价的开仓金额，优先于 cost_rate
    pub legal_cost: f64,
    pub leverage: f64,
    /// 基础币数量
    pub amount: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// 限价单最多等待的K线数
    pub stop_bars: i32,
    pub order_type: OrderType,
}

impl EnterReq {
    pub fn long(tag: &str) -> Self {
        Self { tag: tag.to_string(), cost_rate: 1.0, ..Default::default() }
    }

    pub fn short(tag: &str) -> Self {
        Self { tag: tag.to_string(), short: true, cost_rate: 1.0, ..Default::default() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitDirt {
    Long,
    Short,
    #[default]
    Both,
}

/// 平仓请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitReq {
    pub tag: String,
    pub dirt: ExitDirt,
    pub limit: f64,
    /// 平仓比例 (0, 1]
    pub exit_rate: f64,
    pub amount: f64,
    /// 只平该标签的开仓，空表示全部
    pub enter_tag: String,
    pub order_id: i64,
    /// 只取消尚未成交的开仓单
    pub un_open_only: bool,
    pub order_type: OrderType,
}

impl Default for ExitReq {
    fn default() -> Self {
        Self {
            tag: String::new(),
            dirt: ExitDirt::Both,
            limit: 0.0,
            exit_rate: 1.0,
            amount: 0.0,
            enter_tag: String::new(),
            order_id: 0,
            un_open_only: false,
            order_type: OrderType::Market,
        }
    }
}

impl ExitReq {
    pub fn new(tag: &str, dirt: ExitDirt) -> Self {
        Self { tag: tag.to_string(), dirt, ..Default::default() }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.exit_rate > 0.0 && self.exit_rate <= 1.0) {
            return Err(AppError::DataError(format!("平仓比例必须在 (0, 1] 内: {}", self.exit_rate)));
        }
        Ok(())
    }
}

/// 策略运行环境
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEnv {
    pub exchange: String,
    pub market: String,
}

/// 一次K线回调的上下文
#[derive(Debug, Clone)]
pub struct StratJob {
    pub env: Arc<JobEnv>,
    pub symbol: String,
    pub tf: String,
    pub bar: Kline,
    pub is_warmup: bool,
    pub entrys: Vec<EnterReq>,
    pub exits: Vec<ExitReq>,
    pub open_long: bool,
    pub open_short: bool,
    pub close_long: bool,
    pub close_short: bool,
    /// 策略发现爆仓时填写，运行器记录后继续
    pub liquidation: Option<String>,
}

impl StratJob {
    pub fn new(env: Arc<JobEnv>, symbol: &str, tf: &str, bar: Kline, is_warmup: bool) -> Self {
        Self {
            env,
            symbol: symbol.to_string(),
            tf: tf.to_string(),
            bar,
            is_warmup,
            entrys: Vec::new(),
            exits: Vec::new(),
            open_long: true,
            open_short: true,
            close_long: true,
            close_short: true,
            liquidation: None,
        }
    }

    /// 按开关丢弃不允许的请求
    pub fn apply_gates(&mut self) {
        let (open_long, open_short) = (self.open_long, self.open_short);
        self.entrys.retain(|e| if e.short { open_short } else { open_long });
        let (close_long, close_short) = (self.close_long, self.close_short);
        self.exits.retain_mut(|x| match x.dirt {
            ExitDirt::Long => close_long,
            ExitDirt::Short => close_short,
            ExitDirt::Both => {
                if close_long && close_short {
                    true
                } else if close_long {
                    x.dirt = ExitDirt::Long;
                    true
                } else if close_short {
                    x.dirt = ExitDirt::Short;
                    true
                } else {
                    false
                }
            }
        });
    }
}

pub trait Strategy: Send {
    fn name(&self) -> &str;

    fn on_bar(&mut self, job: &mut StratJob);
}

/// 订单出口，由外部订单管理实现
pub trait OrderSink: Send + Sync {
    fn submit(&self, job: &StratJob, entrys: Vec<EnterReq>, exits: Vec<ExitReq>) -> Result<()>;
}

/// 按 (品种, 周期) 分发K线给策略
pub struct StratRunner {
    env: Arc<JobEnv>,
    strats: BTreeMap<(String, String), Vec<Box<dyn Strategy>>>,
    sink: Option<Arc<dyn OrderSink>>,
    calls: u64,
}

impl StratRunner {
    pub fn new(env: JobEnv, sink: Option<Arc<dyn OrderSink>>) -> Self {
        Self { env: Arc::new(env), strats: BTreeMap::new(), sink, calls: 0 }
    }

    pub fn add_strategy(&mut self, symbol: &str, tf: &str, strat: Box<dyn Strategy>) {
        self.strats.entry((symbol.to_string(), tf.to_string())).or_default().push(strat);
    }

    pub fn remove_symbol(&mut self, symbol: &str) {
        self.strats.retain(|(sym, _), _| sym != symbol);
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl BarHandler for StratRunner {
    fn on_bar(&mut self, symbol: &str, tf: &str, bar: &Kline, is_warmup: bool) {
        let Some(strats) = self.strats.get_mut(&(symbol.to_string(), tf.to_string())) else {
            return;
        };
        for strat in strats.iter_mut() {
            self.calls += 1;
            let mut job = StratJob::new(self.env.clone(), symbol, tf, *bar, is_warmup);
            strat.on_bar(&mut job);
            if let Some(reason) = job.liquidation.take() {
                warn!(target: "klfeed", symbol, tf, strategy = strat.name(), reason = %reason, "策略报告爆仓，继续运行");
            }
            if is_warmup {
                continue;
            }
            job.apply_gates();
            let entrys = std::mem::take(&mut job.entrys);
            let mut exits = std::mem::take(&mut job.exits);
            exits.retain(|x| match x.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(target: "klfeed", symbol, tf, strategy = strat.name(), error.details = %e, "丢弃无效平仓请求");
                    false
                }
            });
            if entrys.is_empty() && exits.is_empty() {
                continue;
            }
            match &self.sink {
                Some(sink) => {
                    if let Err(e) = sink.submit(&job, entrys, exits) {
                        error!(target: "klfeed", symbol, tf, error.summary = e.get_error_type_summary(), error.details = %e, "提交订单失败");
                    }
                }
                None => debug!(target: "klfeed", symbol, tf, "未配置订单出口，忽略订单"),
            }
        }
    }
}
