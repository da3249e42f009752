use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::Chat;
use crate::constants::{
    EVENT_CARD_VERIFIED, EVENT_CHAT_LIST_UPDATED, EVENT_NEW_MESSAGE, EVENT_NOTIFICATION,
};
use crate::types::{CardStatus, ChatId, MessageId, NotificationId, NotificationType, UserId};

/// All events pushed to a connected client session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum RealtimeEvent {
    /// A notification was stored for the session's user.
    Notification(NotificationPayload),

    /// Chats appeared in or disappeared from the user's chat list.
    ChatListUpdated(ChatListUpdate),

    /// The user's card claim was verified.
    CardVerified(CardVerifiedPayload),

    /// A message arrived in one of the user's chats.
    NewMessage(NewMessagePayload),
}

impl RealtimeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RealtimeEvent::Notification(_) => EVENT_NOTIFICATION,
            RealtimeEvent::ChatListUpdated(_) => EVENT_CHAT_LIST_UPDATED,
            RealtimeEvent::CardVerified(_) => EVENT_CARD_VERIFIED,
            RealtimeEvent::NewMessage(_) => EVENT_NEW_MESSAGE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationPayload {
    pub id: NotificationId,
    pub sender_id: UserId,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub optional_val: String,
    pub text: String,
    pub time: DateTime<Utc>,
    /// Receiver's unread counter after this notification.
    pub noti_num: u32,
}

/// Public profile fragment attached to a chat in list updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSummary {
    pub id: UserId,
    pub user_name: String,
    pub card_number: String,
    pub card_verified: CardStatus,
}

/// A chat as shown in a chat list: the thread plus the partner's profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatView {
    pub chat: Chat,
    pub partner: Option<UserSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatListUpdate {
    #[serde(default)]
    pub added: Vec<ChatView>,
    #[serde(default)]
    pub removed: Vec<ChatId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CardVerifiedPayload {
    pub card_number: String,
    pub chat_ids: Vec<ChatId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMessagePayload {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}
