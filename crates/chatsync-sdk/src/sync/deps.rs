//! 依赖完整性检查
//!
//! 纯谓词：判断一条消息引用到的实体（发送者、via-bot、转发来源、
//! @ 提及）是否都已在本地对象库。任何一个缺失都意味着不能应用该消息，
//! 否则会产生残缺的展示状态；缺失按 pts 间隙同样处理。无副作用，可重复调用。

use crate::protocol::{FwdHeader, Message, MessageEntity};
use crate::store::ObjectStore;

/// 检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLoaded {
    Ok,
    /// 发送者未加载
    FromNotLoaded,
    /// via-bot 或转发来源未加载
    NotLoaded,
    /// @ 提及的用户未加载
    MentionNotLoaded,
}

impl DataLoaded {
    pub fn is_ok(&self) -> bool {
        matches!(self, DataLoaded::Ok)
    }
}

pub fn fwd_info_loaded<S: ObjectStore>(store: &S, header: &FwdHeader) -> bool {
    if let Some(channel_id) = header.channel_id {
        if !store.channel_loaded(channel_id) {
            return false;
        }
    }
    if let Some(from_id) = header.from_id {
        if header.channel_id.is_none() && !store.user_loaded(from_id) {
            return false;
        }
    }
    true
}

pub fn mention_users_loaded<S: ObjectStore>(store: &S, entities: &[MessageEntity]) -> bool {
    for entity in entities {
        if let MessageEntity::MentionName { user_id } = entity {
            if !store.user_loaded(*user_id) {
                return false;
            }
        }
    }
    true
}

/// 消息引用的所有实体是否已加载
///
/// 检查顺序：发送者（post 无独立发送者，跳过）、via-bot、转发来源、提及。
pub fn all_data_loaded_for_message<S: ObjectStore>(store: &S, message: &Message) -> DataLoaded {
    if !message.post {
        if let Some(from_id) = message.from_id {
            if !store.user_loaded(from_id) {
                return DataLoaded::FromNotLoaded;
            }
        }
    }
    if let Some(via_bot_id) = message.via_bot_id {
        if !store.user_loaded(via_bot_id) {
            return DataLoaded::NotLoaded;
        }
    }
    if let Some(fwd_from) = &message.fwd_from {
        if !fwd_info_loaded(store, fwd_from) {
            return DataLoaded::NotLoaded;
        }
    }
    if !mention_users_loaded(store, &message.entities) {
        return DataLoaded::MentionNotLoaded;
    }
    DataLoaded::Ok
}
