//! 事件系统 - 同步引擎对 UI 层的通知出口
//!
//! 引擎每应用完一批更新触发一次事件，UI 观察者统一刷新，
//! 不按单条信封逐个通知。ForceReset 是引擎唯一向外升级的信号：
//! 只有重同步本身在结构上不可能时才会发出（需要重新登录）。

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::protocol::Message;

/// 同步事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 收到新消息
    MessageReceived { message: Message },
    /// 消息被编辑
    MessageEdited { message: Message },
    /// 消息被删除
    MessagesDeleted {
        channel_id: Option<u64>,
        ids: Vec<u64>,
    },
    /// 全局状态完成一次同步
    StateSynced { pts: u64, qts: u64, seq: u64 },
    /// 频道完成一次同步
    ChannelSynced { channel_id: u64, pts: u64 },
    /// 会话必须重置（重新认证），引擎唯一的向外升级路径
    ForceReset,
}

impl SyncEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::MessageReceived { .. } => "message_received",
            SyncEvent::MessageEdited { .. } => "message_edited",
            SyncEvent::MessagesDeleted { .. } => "messages_deleted",
            SyncEvent::StateSynced { .. } => "state_synced",
            SyncEvent::ChannelSynced { .. } => "channel_synced",
            SyncEvent::ForceReset => "force_reset",
        }
    }
}

/// 事件管理器（broadcast 扇出）
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// 发布事件（无订阅者时 send 失败属正常场景，仅打 debug）
    pub fn emit(&self, event: SyncEvent) {
        debug!("发布事件: {}", event.event_type());
        if self.sender.send(event).is_err() {
            debug!("事件无订阅者，已丢弃");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_subscribe() {
        let manager = EventManager::new(16);
        let mut rx = manager.subscribe();
        manager.emit(SyncEvent::StateSynced {
            pts: 1,
            qts: 0,
            seq: 2,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "state_synced");
    }

    #[test]
    fn test_emit_without_subscriber_is_silent() {
        let manager = EventManager::new(16);
        manager.emit(SyncEvent::ForceReset);
    }
}
