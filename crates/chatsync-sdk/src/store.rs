//! 本地对象库协作方
//!
//! 引擎不直接写字段，所有变更都走这里的 merge 接口；依赖完整性检查
//! 只读取 loaded 谓词。`MemoryStore` 是给测试和轻量客户端用的内存实现，
//! 持久化存储可自行实现该 trait。

use std::collections::{HashMap, HashSet};

use crate::protocol::{Chat, Message, User};

/// 消息合并顺序
///
/// Unread：difference 回放的新消息，进入未读序列；
/// Last：TooLong 场景整体替换历史尾部。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOrder {
    Unread,
    Last,
}

/// 本地对象库接口
pub trait ObjectStore {
    fn merge_users(&mut self, users: &[User]);
    fn merge_chats(&mut self, chats: &[Chat]);
    fn merge_messages(&mut self, messages: &[Message], order: MergeOrder);
    fn apply_edit(&mut self, message: &Message);
    fn apply_delete(&mut self, channel_id: Option<u64>, ids: &[u64]);
    fn apply_read_inbox(&mut self, peer_id: u64, max_id: u64);
    /// 本端发出消息的服务器确认（random_id -> 服务器 id）
    fn confirm_sent(&mut self, random_id: u64, server_id: u64);
    fn set_user_status(&mut self, user_id: u64, online: bool);

    fn user_loaded(&self, id: u64) -> bool;
    fn chat_loaded(&self, id: u64) -> bool;
    fn channel_loaded(&self, id: u64) -> bool;

    /// 每应用完一批更新调用一次，UI 观察者统一刷新
    fn notify_changes(&mut self);
}

/// 内存对象库
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: HashMap<u64, User>,
    chats: HashMap<u64, Chat>,
    /// (频道流, 消息 id) -> 消息；全局流 key 为 None
    messages: HashMap<(Option<u64>, u64), Message>,
    unread: HashSet<(Option<u64>, u64)>,
    read_inbox_max: HashMap<u64, u64>,
    sent_confirmations: HashMap<u64, u64>,
    notify_count: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message(&self, channel_id: Option<u64>, id: u64) -> Option<&Message> {
        self.messages.get(&(channel_id, id))
    }

    pub fn has_message(&self, channel_id: Option<u64>, id: u64) -> bool {
        self.messages.contains_key(&(channel_id, id))
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn read_inbox_max(&self, peer_id: u64) -> Option<u64> {
        self.read_inbox_max.get(&peer_id).copied()
    }

    pub fn sent_confirmation(&self, random_id: u64) -> Option<u64> {
        self.sent_confirmations.get(&random_id).copied()
    }

    /// 收到过的批次刷新次数
    pub fn notify_count(&self) -> u64 {
        self.notify_count
    }

    pub fn insert_user(&mut self, id: u64, name: &str) {
        self.users.insert(
            id,
            User {
                id,
                name: name.to_string(),
                online: false,
            },
        );
    }

    pub fn insert_chat(&mut self, id: u64, title: &str, is_channel: bool) {
        self.chats.insert(
            id,
            Chat {
                id,
                title: title.to_string(),
                is_channel,
            },
        );
    }
}

impl ObjectStore for MemoryStore {
    fn merge_users(&mut self, users: &[User]) {
        for user in users {
            self.users.insert(user.id, user.clone());
        }
    }

    fn merge_chats(&mut self, chats: &[Chat]) {
        for chat in chats {
            self.chats.insert(chat.id, chat.clone());
        }
    }

    fn merge_messages(&mut self, messages: &[Message], order: MergeOrder) {
        for message in messages {
            let key = (message.channel_id(), message.id);
            if order == MergeOrder::Unread && !self.messages.contains_key(&key) {
                self.unread.insert(key);
            }
            self.messages.insert(key, message.clone());
        }
    }

    fn apply_edit(&mut self, message: &Message) {
        let key = (message.channel_id(), message.id);
        if let Some(existing) = self.messages.get_mut(&key) {
            existing.text = message.text.clone();
            existing.entities = message.entities.clone();
        } else {
            self.messages.insert(key, message.clone());
        }
    }

    fn apply_delete(&mut self, channel_id: Option<u64>, ids: &[u64]) {
        for id in ids {
            let key = (channel_id, *id);
            self.messages.remove(&key);
            self.unread.remove(&key);
        }
    }

    fn apply_read_inbox(&mut self, peer_id: u64, max_id: u64) {
        let entry = self.read_inbox_max.entry(peer_id).or_insert(0);
        if max_id > *entry {
            *entry = max_id;
        }
    }

    fn confirm_sent(&mut self, random_id: u64, server_id: u64) {
        self.sent_confirmations.insert(random_id, server_id);
    }

    fn set_user_status(&mut self, user_id: u64, online: bool) {
        if let Some(user) = self.users.get_mut(&user_id) {
            user.online = online;
        }
    }

    fn user_loaded(&self, id: u64) -> bool {
        self.users.contains_key(&id)
    }

    fn chat_loaded(&self, id: u64) -> bool {
        self.chats.contains_key(&id)
    }

    fn channel_loaded(&self, id: u64) -> bool {
        self.chats.get(&id).map(|c| c.is_channel).unwrap_or(false)
    }

    fn notify_changes(&mut self) {
        self.notify_count += 1;
    }
}
