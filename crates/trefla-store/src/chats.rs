use chrono::Utc;
use rusqlite::params;

use trefla_shared::constants::NO_RECEIVER_ID;
use trefla_shared::types::{AcceptStatus, ChatId, UserId};

use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::Chat;
use crate::row;

const CHAT_COLUMNS: &str = "id, holders, is_for_card, card_number, card_verified,
     accept_status, slots, created_at, updated_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert `chat` and return it with its assigned id.  The incoming id is
    /// ignored.
    pub fn create_chat(&self, chat: &Chat) -> Result<Chat> {
        self.conn().execute(
            "INSERT INTO chats (holders, is_for_card, card_number, card_verified,
                                accept_status, slots, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row::to_json(&chat.chain)?,
                chat.is_for_card,
                chat.card_number,
                chat.card_verified,
                chat.accept_status.code(),
                row::to_json(&chat.slots)?,
                chat.created_at.to_rfc3339(),
                chat.updated_at.to_rfc3339(),
            ],
        )?;
        self.get_chat(ChatId(self.conn().last_insert_rowid()))
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_chat(&self, id: ChatId) -> Result<Chat> {
        self.conn()
            .query_row(
                &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1"),
                params![id.0],
                row_to_chat,
            )
            .map_err(not_found)
    }

    /// All card chats addressed to `card_number`, oldest first.
    pub fn chats_for_card(&self, card_number: &str) -> Result<Vec<Chat>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats
             WHERE is_for_card = 1 AND card_number = ?1
             ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![card_number], row_to_chat)?;

        let mut chats = Vec::new();
        for row in rows {
            chats.push(row?);
        }
        Ok(chats)
    }

    /// The card chat `creator` opened for `card_number`, if any.
    pub fn card_chat_of_creator(&self, creator: UserId, card_number: &str) -> Result<Option<Chat>> {
        Ok(self
            .chats_for_card(card_number)?
            .into_iter()
            .find(|chat| chat.creator() == creator))
    }

    /// Every chat whose ownership chain mentions `user_id`, newest activity
    /// first.  Callers decide visibility.
    pub fn chats_for_user(&self, user_id: UserId) -> Result<Vec<Chat>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats
             WHERE EXISTS (
                 SELECT 1 FROM json_each(chats.holders)
                 WHERE json_extract(json_each.value, '$.user_id') = ?1
             )
             ORDER BY updated_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map(params![user_id.0], row_to_chat)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    pub fn save_chat(&self, chat: &Chat) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE chats SET holders = ?1, card_verified = ?2, accept_status = ?3,
                 slots = ?4, updated_at = ?5
             WHERE id = ?6",
            params![
                row::to_json(&chat.chain)?,
                chat.card_verified,
                chat.accept_status.code(),
                row::to_json(&chat.slots)?,
                chat.updated_at.to_rfc3339(),
                chat.id.0,
            ],
        )?;
        if affected == 0 {
            return Err(crate::StoreError::NotFound);
        }
        Ok(())
    }

    pub fn set_accept_status(&self, id: ChatId, status: AcceptStatus) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE chats SET accept_status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.code(), Utc::now().to_rfc3339(), id.0],
        )?;
        Ok(affected > 0)
    }

    /// Re-address every message the creator of card chat `id` sent.
    ///
    /// `None` marks them as having no receiver.  Returns the number of
    /// messages touched.
    pub fn update_receiver_in_card_chat(
        &self,
        id: ChatId,
        new_receiver: Option<UserId>,
    ) -> Result<usize> {
        let receiver = new_receiver.map(|u| u.0).unwrap_or(NO_RECEIVER_ID);
        let affected = self.conn().execute(
            "UPDATE messages SET receiver_id = ?1
             WHERE chat_id = ?2
               AND sender_id = (
                   SELECT json_extract(holders, '$[0].user_id') FROM chats
                   WHERE id = ?2 AND is_for_card = 1
               )",
            params![receiver, id.0],
        )?;
        Ok(affected)
    }
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        id: ChatId(row.get(0)?),
        chain: row::json(row, 1)?,
        is_for_card: row.get(2)?,
        card_number: row.get(3)?,
        card_verified: row.get(4)?,
        accept_status: AcceptStatus::from_code(row.get(5)?),
        slots: row::json(row, 6)?,
        created_at: row::timestamp(row, 7)?,
        updated_at: row::timestamp(row, 8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use trefla_shared::Promotion;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn chain_survives_storage() {
        let db = db();
        let mut chat = db.create_chat(&Chat::new_card(UserId(5), "XYZ")).unwrap();
        assert_eq!(chat.promote(UserId(7), None), Some(Promotion::Appended));
        chat.slots.unread_nums[0] = 3;
        db.save_chat(&chat).unwrap();

        let loaded = db.get_chat(chat.id).unwrap();
        assert_eq!(loaded.chain.user_ids(), vec![UserId(5), UserId(7)]);
        assert!(loaded.card_verified);
        assert_eq!(loaded.slots.unread_nums, [3, 0]);
    }

    #[test]
    fn card_chats_are_looked_up_by_card() {
        let db = db();
        let a = db.create_chat(&Chat::new_card(UserId(1), "AAA")).unwrap();
        let b = db.create_chat(&Chat::new_card(UserId(2), "AAA")).unwrap();
        db.create_chat(&Chat::new_card(UserId(3), "BBB")).unwrap();
        db.create_chat(&Chat::new_direct(UserId(1), UserId(2))).unwrap();

        let ids: Vec<_> = db.chats_for_card("AAA").unwrap().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
        assert_eq!(
            db.card_chat_of_creator(UserId(2), "AAA").unwrap().map(|c| c.id),
            Some(b.id)
        );
        assert!(db.card_chat_of_creator(UserId(9), "AAA").unwrap().is_none());
    }

    #[test]
    fn chats_for_user_searches_whole_chain() {
        let db = db();
        let mut chat = db.create_chat(&Chat::new_card(UserId(1), "AAA")).unwrap();
        chat.promote(UserId(2), None);
        chat.promote(UserId(3), None);
        db.save_chat(&chat).unwrap();

        assert_eq!(db.chats_for_user(UserId(2)).unwrap().len(), 1);
        assert_eq!(db.chats_for_user(UserId(3)).unwrap().len(), 1);
        assert!(db.chats_for_user(UserId(4)).unwrap().is_empty());
    }

    #[test]
    fn only_creator_messages_are_readdressed() {
        let db = db();
        let chat = db.create_chat(&Chat::new_card(UserId(1), "AAA")).unwrap();
        db.insert_message(chat.id, UserId(1), UserId(0), "hello").unwrap();
        db.insert_message(chat.id, UserId(1), UserId(0), "anyone?").unwrap();
        db.insert_message(chat.id, UserId(2), UserId(1), "me").unwrap();

        assert_eq!(db.update_receiver_in_card_chat(chat.id, Some(UserId(2))).unwrap(), 2);
        let messages = db.messages_for_chat(chat.id, 10, 0).unwrap();
        assert!(messages
            .iter()
            .filter(|m| m.sender_id == UserId(1))
            .all(|m| m.receiver_id == UserId(2)));

        assert_eq!(db.update_receiver_in_card_chat(chat.id, None).unwrap(), 2);
        let last = db.last_message_in_chat(chat.id).unwrap().unwrap();
        assert_eq!(last.receiver_id, UserId(1));
    }
}
