//! 更新同步模块
//!
//! 职责：
//! - 维护全局 pts / qts / seq / date 计数器
//! - seq 间隙缓冲与到期强制补齐
//! - 每频道独立的 pts 记录与请求状态
//! - 消息依赖完整性检查（发送者 / via-bot / 转发来源 / 提及）
//! - difference 协调：至多一个在途、失败指数退避、short poll
//! - 引擎：信封分类与应用的唯一入口

pub mod channel_table;
pub mod coordinator;
pub mod counters;
pub mod deps;
pub mod engine;
pub mod gap_buffer;

pub(crate) mod applier;

pub use channel_table::{ChannelSyncRecord, ChannelSyncTable};
pub use coordinator::{ChannelTrigger, PendingRequest};
pub use counters::SyncCounters;
pub use deps::{all_data_loaded_for_message, DataLoaded};
pub use engine::SyncEngine;
pub use gap_buffer::GapBuffer;
