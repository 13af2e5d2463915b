//! 更新协议模型
//!
//! 服务器推送的更新信封（UpdateEnvelope）、内部更新负载（Update）以及
//! difference 拉取结果的数据结构。信封由传输层产出、引擎消费一次；
//! 全部带 serde 派生以便跨进程 / FFI 边界传递。

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// 会话归属方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Peer {
    User(u64),
    Chat(u64),
    Channel(u64),
}

impl Peer {
    /// 频道流归属（非频道消息走全局流）
    pub fn channel_id(&self) -> Option<u64> {
        match self {
            Peer::Channel(id) => Some(*id),
            _ => None,
        }
    }
}

/// 用户实体（merge 负载，只带展示所需最小字段）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub online: bool,
}

/// 会话实体（普通群与频道共用，`is_channel` 区分）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub is_channel: bool,
}

/// 转发来源头
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FwdHeader {
    pub from_id: Option<u64>,
    pub channel_id: Option<u64>,
}

/// 富文本实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageEntity {
    /// @ 提及（按用户 id 解析，要求该用户已加载）
    MentionName { user_id: u64 },
    /// 其余实体类型不参与依赖检查
    Other,
}

/// 消息实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub peer: Peer,
    /// 发送者；频道 post 没有独立发送者
    pub from_id: Option<u64>,
    #[serde(default)]
    pub post: bool,
    pub via_bot_id: Option<u64>,
    pub fwd_from: Option<FwdHeader>,
    #[serde(default)]
    pub entities: Vec<MessageEntity>,
    pub date: i64,
    pub text: String,
}

impl Message {
    pub fn channel_id(&self) -> Option<u64> {
        self.peer.channel_id()
    }

    /// 服务器时间（unix 秒）转为 UTC 时间点
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.date, 0).single()
    }
}

/// 内部更新负载（闭集，引擎 exhaustive match）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Update {
    NewMessage {
        message: Message,
        pts: u64,
        pts_count: u32,
    },
    NewChannelMessage {
        channel_id: u64,
        message: Message,
        pts: u64,
        pts_count: u32,
    },
    EditMessage {
        message: Message,
        pts: u64,
        pts_count: u32,
    },
    EditChannelMessage {
        channel_id: u64,
        message: Message,
        pts: u64,
        pts_count: u32,
    },
    DeleteMessages {
        ids: Vec<u64>,
        pts: u64,
        pts_count: u32,
    },
    DeleteChannelMessages {
        channel_id: u64,
        ids: Vec<u64>,
        pts: u64,
        pts_count: u32,
    },
    ReadHistoryInbox {
        peer_id: u64,
        max_id: u64,
        pts: u64,
        pts_count: u32,
    },
    /// 频道侧落后过多，必须对该频道单独发起 difference
    ChannelTooLong {
        channel_id: u64,
        pts: Option<u64>,
    },
    /// 不带 pts 的轻量更新，直接应用
    UserStatus {
        user_id: u64,
        online: bool,
    },
}

impl Update {
    /// pts 信息（非 pts 更新返回 None）
    pub fn pts_info(&self) -> Option<(u64, u32)> {
        match self {
            Update::NewMessage { pts, pts_count, .. }
            | Update::NewChannelMessage { pts, pts_count, .. }
            | Update::EditMessage { pts, pts_count, .. }
            | Update::EditChannelMessage { pts, pts_count, .. }
            | Update::DeleteMessages { pts, pts_count, .. }
            | Update::DeleteChannelMessages { pts, pts_count, .. }
            | Update::ReadHistoryInbox { pts, pts_count, .. } => Some((*pts, *pts_count)),
            Update::ChannelTooLong { .. } | Update::UserStatus { .. } => None,
        }
    }

    /// pts 计数所属的频道流（None = 全局流）
    pub fn scope_channel_id(&self) -> Option<u64> {
        match self {
            Update::NewChannelMessage { channel_id, .. }
            | Update::EditChannelMessage { channel_id, .. }
            | Update::DeleteChannelMessages { channel_id, .. }
            | Update::ChannelTooLong { channel_id, .. } => Some(*channel_id),
            _ => None,
        }
    }

    /// 携带的消息体（依赖检查入口）
    pub fn message(&self) -> Option<&Message> {
        match self {
            Update::NewMessage { message, .. }
            | Update::NewChannelMessage { message, .. }
            | Update::EditMessage { message, .. }
            | Update::EditChannelMessage { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// 服务器推送的更新信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateEnvelope {
    /// 单条更新
    Single { update: Update },
    /// 组合批次；`seq_start == 0` 表示不参与 seq 排序
    Combined {
        seq_start: u64,
        seq: u64,
        date: i64,
        users: Vec<User>,
        chats: Vec<Chat>,
        updates: Vec<Update>,
    },
    /// 私聊消息短格式
    ShortMessage {
        id: u64,
        user_id: u64,
        text: String,
        out: bool,
        via_bot_id: Option<u64>,
        fwd_from: Option<FwdHeader>,
        entities: Vec<MessageEntity>,
        pts: u64,
        pts_count: u32,
        date: i64,
    },
    /// 群聊消息短格式
    ShortChatMessage {
        id: u64,
        from_id: u64,
        chat_id: u64,
        text: String,
        out: bool,
        via_bot_id: Option<u64>,
        fwd_from: Option<FwdHeader>,
        entities: Vec<MessageEntity>,
        pts: u64,
        pts_count: u32,
        date: i64,
    },
    /// 自己发送消息的服务器确认
    ShortSentMessage {
        id: u64,
        entities: Vec<MessageEntity>,
        pts: u64,
        pts_count: u32,
        date: i64,
    },
    /// 更新流落后过多，需要全量 difference
    TooLong,
    /// 服务器新建会话，seq 跟踪作废
    NewSession,
}

/// 全局计数器状态（difference 响应内嵌）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatesState {
    pub pts: u64,
    pub qts: u64,
    pub seq: u64,
    pub date: i64,
}

/// 全局 difference 拉取结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Difference {
    /// 没有落后，只刷新计数器
    Empty { date: i64, seq: u64 },
    /// 部分结果，应用后需要立即再拉一片
    Slice {
        new_messages: Vec<Message>,
        other_updates: Vec<Update>,
        users: Vec<User>,
        chats: Vec<Chat>,
        intermediate_state: UpdatesState,
    },
    /// 最终结果
    Full {
        new_messages: Vec<Message>,
        other_updates: Vec<Update>,
        users: Vec<User>,
        chats: Vec<Chat>,
        state: UpdatesState,
    },
    /// 增量无法解析（协议层不支持），引擎只能上报会话重置
    TooLong { pts: u64 },
}

/// 频道 difference 拉取结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChannelDifference {
    Empty {
        pts: u64,
        is_final: bool,
        timeout: Option<u64>,
    },
    /// 本地落后过多：只给最近一段消息，pts 整体采纳
    TooLong {
        pts: u64,
        is_final: bool,
        timeout: Option<u64>,
        users: Vec<User>,
        chats: Vec<Chat>,
        messages: Vec<Message>,
    },
    Diff {
        pts: u64,
        is_final: bool,
        timeout: Option<u64>,
        new_messages: Vec<Message>,
        other_updates: Vec<Update>,
        users: Vec<User>,
        chats: Vec<Chat>,
    },
}
