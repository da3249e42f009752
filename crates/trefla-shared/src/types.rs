use serde::{Deserialize, Serialize};

use crate::constants::SYSTEM_SENDER_ID;
use crate::error::TypeError;

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

row_id!(
    /// Primary key of a row in `users`.
    UserId
);
row_id!(ChatId);
row_id!(MessageId);
row_id!(NotificationId);
row_id!(AdminNotificationId);

impl UserId {
    /// The pseudo-user that system and admin notifications come from.
    pub const SYSTEM: UserId = UserId(SYSTEM_SENDER_ID);

    pub fn is_system(self) -> bool {
        self == Self::SYSTEM
    }
}

// ---------------------------------------------------------------------------
// Card status
// ---------------------------------------------------------------------------

/// Verification state of a user's card claim.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    #[default]
    Unverified,
    Verified,
    Rejected,
}

impl CardStatus {
    pub fn code(self) -> i64 {
        match self {
            CardStatus::Unverified => 0,
            CardStatus::Verified => 1,
            CardStatus::Rejected => 2,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, TypeError> {
        match code {
            0 => Ok(CardStatus::Unverified),
            1 => Ok(CardStatus::Verified),
            2 => Ok(CardStatus::Rejected),
            other => Err(TypeError::UnknownCardStatus(other)),
        }
    }

    pub fn is_verified(self) -> bool {
        self == CardStatus::Verified
    }
}

// ---------------------------------------------------------------------------
// Chat acceptance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AcceptStatus {
    #[default]
    Pending,
    Accepted,
}

impl AcceptStatus {
    pub fn code(self) -> i64 {
        match self {
            AcceptStatus::Pending => 0,
            AcceptStatus::Accepted => 1,
        }
    }

    pub fn from_code(code: i64) -> Self {
        if code == 0 {
            AcceptStatus::Pending
        } else {
            AcceptStatus::Accepted
        }
    }
}

// ---------------------------------------------------------------------------
// Notification types
// ---------------------------------------------------------------------------

/// Kinds of user-facing notification.  Codes are persisted, so existing
/// values must never be renumbered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    PostLike,
    CommentLike,
    PostComment,
    CommentReply,
    CardVerifyAccept,
    CardVerifyReject,
    CardTransferRequest,
    CardTransferAccept,
    CardTransferReject,
    AdminMessage,
}

impl NotificationType {
    pub fn code(self) -> i64 {
        match self {
            NotificationType::PostLike => 1,
            NotificationType::CommentLike => 2,
            NotificationType::PostComment => 3,
            NotificationType::CommentReply => 4,
            NotificationType::CardVerifyAccept => 10,
            NotificationType::CardVerifyReject => 11,
            NotificationType::CardTransferRequest => 12,
            NotificationType::CardTransferAccept => 13,
            NotificationType::CardTransferReject => 14,
            NotificationType::AdminMessage => 20,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, TypeError> {
        Ok(match code {
            1 => NotificationType::PostLike,
            2 => NotificationType::CommentLike,
            3 => NotificationType::PostComment,
            4 => NotificationType::CommentReply,
            10 => NotificationType::CardVerifyAccept,
            11 => NotificationType::CardVerifyReject,
            12 => NotificationType::CardTransferRequest,
            13 => NotificationType::CardTransferAccept,
            14 => NotificationType::CardTransferReject,
            20 => NotificationType::AdminMessage,
            other => return Err(TypeError::UnknownNotificationType(other)),
        })
    }
}

/// Kinds of back-office work item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdminNotificationType {
    IdTransfer,
    BugReport,
}

impl AdminNotificationType {
    pub fn as_str(self) -> &'static str {
        match self {
            AdminNotificationType::IdTransfer => "ID_TRANSFER",
            AdminNotificationType::BugReport => "BUG_REPORT",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TypeError> {
        match s {
            "ID_TRANSFER" => Ok(AdminNotificationType::IdTransfer),
            "BUG_REPORT" => Ok(AdminNotificationType::BugReport),
            other => Err(TypeError::UnknownAdminNotificationType(other.to_string())),
        }
    }
}

/// Payload of an `ID_TRANSFER` work item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferPayload {
    /// The user asking to take over the card.
    pub from: UserId,
    /// The current verified holder.
    pub to: UserId,
    pub card_number: String,
}
