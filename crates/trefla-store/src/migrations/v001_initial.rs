//! v001 -- Initial schema creation.
//!
//! Creates the four core tables: `users`, `chats`, `messages` and
//! `notifications`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    user_name     TEXT NOT NULL,
    email         TEXT NOT NULL DEFAULT '',
    card_number   TEXT NOT NULL DEFAULT '',
    card_img_url  TEXT NOT NULL DEFAULT '',
    card_verified INTEGER NOT NULL DEFAULT 0,   -- 0 unverified, 1 verified, 2 rejected
    noti_num      INTEGER NOT NULL DEFAULT 0,
    socket_id     TEXT,                         -- live session uuid, NULL when offline
    device_token  TEXT NOT NULL DEFAULT '',
    created_at    TEXT NOT NULL,                -- RFC-3339
    updated_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_users_card ON users(card_number, card_verified);

-- ----------------------------------------------------------------
-- Chats
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chats (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    holders       TEXT NOT NULL,                -- JSON ownership chain
    is_for_card   INTEGER NOT NULL DEFAULT 0,
    card_number   TEXT NOT NULL DEFAULT '',
    card_verified INTEGER NOT NULL DEFAULT 0,
    accept_status INTEGER NOT NULL DEFAULT 0,
    slots         TEXT NOT NULL,                -- JSON unread/online per active slot
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chats_card ON chats(is_for_card, card_number);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_id     INTEGER NOT NULL,
    sender_id   INTEGER NOT NULL,
    receiver_id INTEGER NOT NULL DEFAULT 0,     -- 0 while the card has no holder
    message     TEXT NOT NULL,
    created_at  TEXT NOT NULL,

    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, id DESC);

-- ----------------------------------------------------------------
-- Notifications
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS notifications (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    sender_id    INTEGER NOT NULL DEFAULT 0,    -- 0 = system / admin
    receiver_id  INTEGER NOT NULL,
    type         INTEGER NOT NULL,
    optional_val TEXT NOT NULL DEFAULT '',
    text         TEXT NOT NULL DEFAULT '',
    time         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_notifications_receiver ON notifications(receiver_id, id DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
