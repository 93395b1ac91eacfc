// 实时行情：矿工、爬虫服务与监听客户端
pub mod hub;
pub mod miner;
pub mod protocol;
pub mod spider;
pub mod watcher;
pub mod writer;

pub use hub::ClientHub;
pub use miner::{Miner, StreamState};
pub use protocol::{IOMsg, MsgCodec, WatchReq};
pub use spider::Spider;
pub use watcher::{KLineHandler, KLineMsg, KLineWatcher};
pub use writer::{SaveKline, WriteQueue};
