//! ChatSync SDK - 即时通讯更新同步引擎
//!
//! 客户端侧的更新流同步：服务器推送以 pts / qts / seq 计数器编号，
//! 引擎保证每条更新恰好应用一次、按序应用，检测到间隙时自动拉取
//! difference 补齐。包括：
//! - 📈 全局 pts / qts / seq / date 计数器与衔接判定
//! - 🧩 seq 乱序批次缓冲，超时强制补齐
//! - 📡 每频道独立 pts 流，互不阻塞的频道 difference
//! - 🔍 消息依赖完整性检查（发送者 / via-bot / 转发来源 / 提及）
//! - ⏳ 失败指数退避（1s 起倍增，64s 封顶，成功归位）
//! - 💤 静默保活探测与休眠恢复
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Instant;
//! use chatsync_sdk::{MemoryStore, SyncConfig, SyncEngine, SyncService, UpdatesState};
//! # use chatsync_sdk::{Transport, TransportError, Difference, ChannelDifference};
//! # struct MyTransport;
//! # #[async_trait::async_trait]
//! # impl Transport for MyTransport {
//! #     async fn request_full_difference(&self, _: u64, _: u64, _: i64)
//! #         -> Result<Difference, TransportError> { unimplemented!() }
//! #     async fn request_channel_difference(&self, _: u64, _: u64, _: bool, _: u32)
//! #         -> Result<ChannelDifference, TransportError> { unimplemented!() }
//! #     async fn send_liveness_probe(&self) {}
//! # }
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut engine = SyncEngine::new(MemoryStore::new(), SyncConfig::default());
//!     engine.set_state(
//!         UpdatesState { pts: 100, qts: 0, seq: 0, date: 1700000000 },
//!         Instant::now(),
//!     );
//!
//!     let transport = Arc::new(MyTransport);
//!     let (service, envelope_tx) = SyncService::new(engine, transport, 256);
//!     let events = service.engine().lock().subscribe_events();
//!
//!     tokio::spawn(service.run());
//!     // 传输层收到的推送信封喂给 envelope_tx，
//!     // 应用侧从 events 消费 MessageReceived 等事件。
//!     # drop(envelope_tx);
//!     # drop(events);
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod service;
pub mod store;
pub mod sync;
pub mod transport;

pub use config::SyncConfig;
pub use error::{ChatSyncError, Result};
pub use events::SyncEvent;
pub use protocol::{
    ChannelDifference, Chat, Difference, FwdHeader, Message, MessageEntity, Peer, Update,
    UpdateEnvelope, UpdatesState, User,
};
pub use service::SyncService;
pub use store::{MemoryStore, MergeOrder, ObjectStore};
pub use sync::{ChannelTrigger, PendingRequest, SyncCounters, SyncEngine};
pub use transport::{Transport, TransportError};
