/// Sender id used for notifications raised by the system or an admin.
pub const SYSTEM_SENDER_ID: i64 = 0;

/// Receiver id written on card-chat messages while nobody holds the card.
pub const NO_RECEIVER_ID: i64 = 0;

/// Chain slot of the chat creator in `ActiveSlots`.
pub const CREATOR_SLOT: usize = 0;

/// Chain slot of the active receiver in `ActiveSlots`.
pub const RECEIVER_SLOT: usize = 1;

/// Real-time event names, as seen by connected clients.
pub const EVENT_NOTIFICATION: &str = "notification";
pub const EVENT_CHAT_LIST_UPDATED: &str = "chat_list_updated";
pub const EVENT_CARD_VERIFIED: &str = "card_verified";
pub const EVENT_NEW_MESSAGE: &str = "new_message";

/// Device push titles.
pub const PUSH_TITLE_CARD_VERIFIED: &str = "Card verified";
pub const PUSH_TITLE_CARD_REJECTED: &str = "Card verification rejected";
pub const PUSH_TITLE_CARD_UNVERIFIED: &str = "Card verification withdrawn";
