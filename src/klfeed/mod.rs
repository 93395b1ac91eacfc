// 策略执行侧：喂入器、数据源和策略接口
pub mod feeder;
pub mod hist;
pub mod prices;
pub mod provider;
pub mod refresh;
pub mod strategy;

pub use feeder::{BarHandler, Feeder, TfState};
pub use hist::{DbKlineFeeder, HistFeeder, HistKLineFeeder, KlineFeeder};
pub use prices::PriceCache;
pub use provider::{HistProvider, LiveProvider, PairSource, Provider, ReplayStats, SubResult, WarmItems};
pub use refresh::RefreshSchedule;
pub use strategy::{EnterReq, ExitDirt, ExitReq, JobEnv, OrderSink, StratJob, StratRunner, Strategy};
