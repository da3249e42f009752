use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use trefla_shared::types::{ChatId, MessageId, UserId};

use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::Message;
use crate::row;

impl Database {
    pub fn insert_message(
        &self,
        chat_id: ChatId,
        sender_id: UserId,
        receiver_id: UserId,
        text: &str,
    ) -> Result<Message> {
        self.conn().execute(
            "INSERT INTO messages (chat_id, sender_id, receiver_id, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![chat_id.0, sender_id.0, receiver_id.0, text, Utc::now().to_rfc3339()],
        )?;
        self.get_message(MessageId(self.conn().last_insert_rowid()))
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                "SELECT id, chat_id, sender_id, receiver_id, message, created_at
                 FROM messages WHERE id = ?1",
                params![id.0],
                row_to_message,
            )
            .map_err(not_found)
    }

    /// Most recent message of a chat, `None` for an empty thread.
    pub fn last_message_in_chat(&self, chat_id: ChatId) -> Result<Option<Message>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, chat_id, sender_id, receiver_id, message, created_at
                 FROM messages WHERE chat_id = ?1
                 ORDER BY id DESC LIMIT 1",
                params![chat_id.0],
                row_to_message,
            )
            .optional()?)
    }

    /// A page of a chat's history, newest first.
    pub fn messages_for_chat(&self, chat_id: ChatId, limit: u32, offset: u32) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, chat_id, sender_id, receiver_id, message, created_at
             FROM messages WHERE chat_id = ?1
             ORDER BY id DESC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(params![chat_id.0, limit, offset], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: MessageId(row.get(0)?),
        chat_id: ChatId(row.get(1)?),
        sender_id: UserId(row.get(2)?),
        receiver_id: UserId(row.get(3)?),
        message: row.get(4)?,
        created_at: row::timestamp(row, 5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chat;

    #[test]
    fn history_is_newest_first() {
        let db = Database::open_in_memory().unwrap();
        let chat = db.create_chat(&Chat::new_direct(UserId(1), UserId(2))).unwrap();
        assert!(db.last_message_in_chat(chat.id).unwrap().is_none());

        for text in ["one", "two", "three"] {
            db.insert_message(chat.id, UserId(1), UserId(2), text).unwrap();
        }

        let page = db.messages_for_chat(chat.id, 2, 0).unwrap();
        let texts: Vec<_> = page.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(texts, vec!["three", "two"]);
        assert_eq!(db.messages_for_chat(chat.id, 2, 2).unwrap().len(), 1);

        let last = db.last_message_in_chat(chat.id).unwrap().unwrap();
        assert_eq!(last.snapshot().text, "three");
    }

    #[test]
    fn message_needs_existing_chat() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.insert_message(ChatId(42), UserId(1), UserId(2), "x").is_err());
    }
}
