//! Domain model structs persisted in the database.
//!
//! Every struct derives `Serialize` so it can be handed directly to the HTTP
//! and real-time layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use trefla_shared::chain::MessageSnapshot;
use trefla_shared::permission::{AdminGrant, AdminRole, PermissionSet};
use trefla_shared::protocol::{NotificationPayload, UserSummary};
use trefla_shared::types::{
    AdminNotificationId, AdminNotificationType, CardStatus, ChatId, MessageId, NotificationId,
    NotificationType, UserId,
};

pub use trefla_shared::chat::{ActiveSlots, Chat};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub user_name: String,
    pub email: String,
    /// Claimed card number, empty when the user has no claim.
    pub card_number: String,
    pub card_img_url: String,
    pub card_verified: CardStatus,
    /// Unread notification counter.
    pub noti_num: u32,
    /// Live session handle, `None` when not connected.
    pub socket_id: Option<Uuid>,
    #[serde(default, skip_serializing)]
    pub device_token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn has_card_info(&self) -> bool {
        !self.card_number.is_empty() || !self.card_img_url.is_empty()
    }

    /// Drop the card claim entirely; the user has to submit again.
    pub fn clear_card_claim(&mut self) {
        self.card_number.clear();
        self.card_img_url.clear();
        self.card_verified = CardStatus::Unverified;
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            user_name: self.user_name.clone(),
            card_number: self.card_number.clone(),
            card_verified: self.card_verified,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    /// `UserId(0)` while the card of a card chat has no holder.
    pub receiver_id: UserId,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn snapshot(&self) -> MessageSnapshot {
        MessageSnapshot {
            message_id: self.id,
            sender_id: self.sender_id,
            text: self.message.clone(),
            sent_at: self.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

/// A stored notification.  Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub id: NotificationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    /// Card number the notification is about, if any.
    pub optional_val: String,
    pub text: String,
    pub time: DateTime<Utc>,
}

impl Notification {
    pub fn payload(&self, noti_num: u32) -> NotificationPayload {
        NotificationPayload {
            id: self.id,
            sender_id: self.sender_id,
            kind: self.kind,
            optional_val: self.optional_val.clone(),
            text: self.text.clone(),
            time: self.time,
            noti_num,
        }
    }
}

/// Insert form of [`Notification`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub kind: NotificationType,
    pub optional_val: String,
    pub text: String,
}

impl NewNotification {
    /// A notification raised by the system about `card_number`.
    pub fn system(receiver_id: UserId, kind: NotificationType, card_number: &str) -> Self {
        Self {
            sender_id: UserId::SYSTEM,
            receiver_id,
            kind,
            optional_val: card_number.to_string(),
            text: String::new(),
        }
    }

    pub fn from_user(mut self, sender_id: UserId) -> Self {
        self.sender_id = sender_id;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }
}

// ---------------------------------------------------------------------------
// Back-office
// ---------------------------------------------------------------------------

/// A back-office work item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminNotification {
    pub id: AdminNotificationId,
    #[serde(rename = "type")]
    pub kind: AdminNotificationType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Admin {
    pub id: i64,
    pub user_name: String,
    pub role: AdminRole,
    pub permissions: PermissionSet,
    pub created_at: DateTime<Utc>,
}

impl Admin {
    pub fn grant(&self) -> AdminGrant {
        AdminGrant {
            role: self.role,
            permissions: self.permissions,
        }
    }
}
