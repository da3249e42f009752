//! Applies chain promotions and demotions to stored card chats.
//!
//! Each chat is rewritten in its own transaction.  A failure on one chat is
//! logged and the remaining chats are still processed.

use tracing::{debug, error, warn};

use trefla_shared::types::{ChatId, UserId};
use trefla_store::{Chat, Database, Result};

/// Chats touched by one relink pass.
#[derive(Debug, Default)]
pub struct RelinkReport {
    /// Every card chat of the card, in creation order, as stored after the pass.
    pub chats: Vec<Chat>,
    /// Chats whose state actually changed.
    pub changed: Vec<ChatId>,
    /// Chats that could not be rewritten.
    pub failed: Vec<ChatId>,
}

impl RelinkReport {
    pub fn chat_ids(&self) -> Vec<ChatId> {
        self.chats.iter().map(|c| c.id).collect()
    }
}

/// Promote one chat to `new_holder`, snapshotting its last message.
///
/// The returned flag is `false` when the chat did not change.
pub fn promote_chat(db: &Database, mut chat: Chat, new_holder: UserId) -> Result<(Chat, bool)> {
    let snapshot = db.last_message_in_chat(chat.id)?.map(|m| m.snapshot());
    let Some(outcome) = chat.promote(new_holder, snapshot) else {
        return Ok((chat, false));
    };

    db.in_transaction(|db| {
        db.save_chat(&chat)?;
        db.update_receiver_in_card_chat(chat.id, Some(chat.active_receiver()))
    })?;

    debug!(chat = %chat.id, holder = %new_holder, ?outcome, "Card chat promoted");
    Ok((chat, true))
}

/// Roll one chat back to its creator.
pub fn demote_chat(db: &Database, mut chat: Chat) -> Result<(Chat, bool)> {
    if !chat.demote() {
        return Ok((chat, false));
    }

    db.in_transaction(|db| {
        db.save_chat(&chat)?;
        db.update_receiver_in_card_chat(chat.id, None)
    })?;

    debug!(chat = %chat.id, "Card chat demoted");
    Ok((chat, true))
}

/// Promote every chat tagged with `card_number` to `new_holder`.
pub fn promote_card_chats(db: &Database, card_number: &str, new_holder: UserId) -> RelinkReport {
    relink_all(db, card_number, |db, chat| promote_chat(db, chat, new_holder))
}

/// Demote every chat tagged with `card_number`.
pub fn demote_card_chats(db: &Database, card_number: &str) -> RelinkReport {
    relink_all(db, card_number, demote_chat)
}

fn relink_all(
    db: &Database,
    card_number: &str,
    mut relink: impl FnMut(&Database, Chat) -> Result<(Chat, bool)>,
) -> RelinkReport {
    let mut report = RelinkReport::default();
    if card_number.is_empty() {
        return report;
    }

    let chats = match db.chats_for_card(card_number) {
        Ok(chats) => chats,
        Err(e) => {
            error!(card = %card_number, error = %e, "Could not load card chats for relinking");
            return report;
        }
    };

    for chat in chats {
        let id = chat.id;
        let original = chat.clone();
        match relink(db, chat) {
            Ok((chat, changed)) => {
                if changed {
                    report.changed.push(id);
                }
                report.chats.push(chat);
            }
            Err(e) => {
                warn!(chat = %id, card = %card_number, error = %e, "Relinking chat failed");
                report.failed.push(id);
                report.chats.push(original);
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn promote_snapshots_last_message_and_readdresses() {
        let db = db();
        let chat = db.create_chat(&Chat::new_card(UserId(5), "XYZ")).unwrap();
        let msg = db.insert_message(chat.id, UserId(5), UserId(0), "hi").unwrap();

        let report = promote_card_chats(&db, "XYZ", UserId(7));
        assert_eq!(report.changed, vec![chat.id]);

        let stored = db.get_chat(chat.id).unwrap();
        assert_eq!(stored.chain.user_ids(), vec![UserId(5), UserId(7)]);
        assert_eq!(stored.chain.holder_record().transfer_message_id, Some(msg.id));
        assert_eq!(db.get_message(msg.id).unwrap().receiver_id, UserId(7));
    }

    #[test]
    fn empty_chat_promotes_with_empty_snapshot() {
        let db = db();
        let chat = db.create_chat(&Chat::new_card(UserId(5), "XYZ")).unwrap();

        let (chat, changed) = promote_chat(&db, chat, UserId(7)).unwrap();
        assert!(changed);
        assert!(chat.chain.holder_record().last_message.is_none());
    }

    #[test]
    fn demote_resets_receivers() {
        let db = db();
        let chat = db.create_chat(&Chat::new_card(UserId(5), "XYZ")).unwrap();
        promote_card_chats(&db, "XYZ", UserId(7));
        let msg = db.insert_message(chat.id, UserId(5), UserId(7), "still there?").unwrap();

        let report = demote_card_chats(&db, "XYZ");
        assert_eq!(report.changed, vec![chat.id]);
        assert_eq!(db.get_message(msg.id).unwrap().receiver_id, UserId(0));

        let again = demote_card_chats(&db, "XYZ");
        assert!(again.changed.is_empty());
        assert_eq!(db.get_chat(chat.id).unwrap().chain.user_ids(), vec![UserId(5)]);
    }

    #[test]
    fn direct_chats_and_other_cards_are_untouched() {
        let db = db();
        let direct = db.create_chat(&Chat::new_direct(UserId(1), UserId(2))).unwrap();
        db.create_chat(&Chat::new_card(UserId(1), "OTHER")).unwrap();

        let report = promote_card_chats(&db, "XYZ", UserId(9));
        assert!(report.chats.is_empty());
        assert_eq!(db.get_chat(direct.id).unwrap().chain.len(), 2);
    }
}
