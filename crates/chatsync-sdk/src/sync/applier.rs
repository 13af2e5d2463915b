//! 更新应用器
//!
//! 把一条已通过 pts / 依赖检查的更新落到对象库并触发事件。
//! pts 记账由引擎负责，这里只做存储变更；ChannelTooLong 在引擎侧
//! 转为频道 difference，不会进到这里。

use tracing::{debug, warn};

use crate::events::{EventManager, SyncEvent};
use crate::protocol::Update;
use crate::store::{MergeOrder, ObjectStore};

/// 应用单条更新的存储副作用
pub(crate) fn apply_update<S: ObjectStore>(store: &mut S, events: &EventManager, update: &Update) {
    match update {
        Update::NewMessage { message, .. } | Update::NewChannelMessage { message, .. } => {
            store.merge_messages(std::slice::from_ref(message), MergeOrder::Unread);
            events.emit(SyncEvent::MessageReceived {
                message: message.clone(),
            });
            debug!("消息已入库: id={}, pts={:?}", message.id, update.pts_info());
        }
        Update::EditMessage { message, .. } | Update::EditChannelMessage { message, .. } => {
            store.apply_edit(message);
            events.emit(SyncEvent::MessageEdited {
                message: message.clone(),
            });
        }
        Update::DeleteMessages { ids, .. } => {
            store.apply_delete(None, ids);
            events.emit(SyncEvent::MessagesDeleted {
                channel_id: None,
                ids: ids.clone(),
            });
        }
        Update::DeleteChannelMessages {
            channel_id, ids, ..
        } => {
            store.apply_delete(Some(*channel_id), ids);
            events.emit(SyncEvent::MessagesDeleted {
                channel_id: Some(*channel_id),
                ids: ids.clone(),
            });
        }
        Update::ReadHistoryInbox {
            peer_id, max_id, ..
        } => {
            store.apply_read_inbox(*peer_id, *max_id);
        }
        Update::UserStatus { user_id, online } => {
            store.set_user_status(*user_id, *online);
        }
        Update::ChannelTooLong { channel_id, .. } => {
            // 引擎应当在分类阶段拦截
            warn!("ChannelTooLong 不应进入应用器: channel_id={}", channel_id);
        }
    }
}
