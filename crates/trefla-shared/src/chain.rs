//! Ownership chain of a card chat.
//!
//! A card chat is addressed to a card number, not to a person.  Its chain is
//! the ordered history of holders: index 0 is the user who opened the chat
//! (never replaced), the last record is the current holder.  Each record
//! carries the snapshot of the chat's last message at the moment that holder
//! took over, so the three pieces of per-holder state can never drift apart.
//!
//! A user appears at most once.  When a previous owner gets the card back,
//! their older record is dropped and a fresh one is appended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::types::{MessageId, UserId};

/// Copy of a chat message taken at the moment of an ownership change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageSnapshot {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

/// One tenure in the chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HolderRecord {
    pub user_id: UserId,
    /// Last message of the chat when this tenure started.
    #[serde(default)]
    pub last_message: Option<MessageSnapshot>,
    /// Messages with a greater id belong to this tenure.
    #[serde(default)]
    pub transfer_message_id: Option<MessageId>,
}

impl HolderRecord {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            last_message: None,
            transfer_message_id: None,
        }
    }

    fn handover(user_id: UserId, snapshot: Option<MessageSnapshot>) -> Self {
        Self {
            user_id,
            transfer_message_id: snapshot.as_ref().map(|s| s.message_id),
            last_message: snapshot,
        }
    }
}

/// Result of [`OwnershipChain::promote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    /// The user already is the last record.
    AlreadyHolder,
    /// A new record was appended.
    Appended,
    /// The user's earlier record was removed, then a new one appended.
    Compacted { removed_index: usize },
    /// The creator got the card: the chain collapsed back to `[creator]`.
    CreatorReclaimed,
}

/// Non-empty, duplicate-free sequence of [`HolderRecord`]s.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "Vec<HolderRecord>", into = "Vec<HolderRecord>")]
pub struct OwnershipChain(Vec<HolderRecord>);

impl TryFrom<Vec<HolderRecord>> for OwnershipChain {
    type Error = TypeError;

    fn try_from(records: Vec<HolderRecord>) -> Result<Self, Self::Error> {
        Self::from_records(records)
    }
}

impl From<OwnershipChain> for Vec<HolderRecord> {
    fn from(chain: OwnershipChain) -> Self {
        chain.0
    }
}

impl OwnershipChain {
    /// Chain of a freshly opened card chat.
    pub fn card(creator: UserId) -> Self {
        Self(vec![HolderRecord::new(creator)])
    }

    /// Static two-party chain of a direct chat.
    pub fn direct(creator: UserId, peer: UserId) -> Self {
        Self(vec![HolderRecord::new(creator), HolderRecord::new(peer)])
    }

    /// Rebuild a chain loaded from storage, enforcing its invariants.
    pub fn from_records(records: Vec<HolderRecord>) -> Result<Self, TypeError> {
        if records.is_empty() {
            return Err(TypeError::EmptyChain);
        }
        for (i, record) in records.iter().enumerate() {
            if records[..i].iter().any(|r| r.user_id == record.user_id) {
                return Err(TypeError::DuplicateHolder(record.user_id.0));
            }
        }
        Ok(Self(records))
    }

    pub fn records(&self) -> &[HolderRecord] {
        &self.0
    }

    pub fn into_records(self) -> Vec<HolderRecord> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn creator(&self) -> UserId {
        self.0[0].user_id
    }

    /// Last record of the chain.
    pub fn holder(&self) -> UserId {
        self.0[self.0.len() - 1].user_id
    }

    pub fn holder_record(&self) -> &HolderRecord {
        &self.0[self.0.len() - 1]
    }

    pub fn user_ids(&self) -> Vec<UserId> {
        self.0.iter().map(|r| r.user_id).collect()
    }

    pub fn position(&self, user_id: UserId) -> Option<usize> {
        self.0.iter().position(|r| r.user_id == user_id)
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.position(user_id).is_some()
    }

    /// A user who held the card before and lost it.
    pub fn is_previous_owner(&self, user_id: UserId) -> bool {
        matches!(self.position(user_id), Some(i) if i > 0 && i + 1 < self.0.len())
    }

    /// Make `new_holder` the last record.
    pub fn promote(&mut self, new_holder: UserId, snapshot: Option<MessageSnapshot>) -> Promotion {
        if self.holder() == new_holder {
            return Promotion::AlreadyHolder;
        }
        if self.creator() == new_holder {
            self.0.truncate(1);
            return Promotion::CreatorReclaimed;
        }

        let removed = self.position(new_holder);
        if let Some(index) = removed {
            self.0.remove(index);
        }
        self.0.push(HolderRecord::handover(new_holder, snapshot));

        match removed {
            Some(removed_index) => Promotion::Compacted { removed_index },
            None => Promotion::Appended,
        }
    }

    /// Truncate back to `[creator]`.  Returns `true` if anything was removed.
    pub fn demote(&mut self) -> bool {
        let changed = self.0.len() > 1;
        self.0.truncate(1);
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: i64) -> MessageSnapshot {
        MessageSnapshot {
            message_id: MessageId(id),
            sender_id: UserId(5),
            text: format!("msg {id}"),
            sent_at: Utc::now(),
        }
    }

    fn has_duplicates(chain: &OwnershipChain) -> bool {
        let ids = chain.user_ids();
        ids.iter()
            .enumerate()
            .any(|(i, id)| ids[..i].contains(id))
    }

    #[test]
    fn promote_appends_new_holder_with_snapshot() {
        let mut chain = OwnershipChain::card(UserId(5));
        let outcome = chain.promote(UserId(7), Some(snapshot(3)));

        assert_eq!(outcome, Promotion::Appended);
        assert_eq!(chain.user_ids(), vec![UserId(5), UserId(7)]);
        assert_eq!(chain.holder_record().transfer_message_id, Some(MessageId(3)));
    }

    #[test]
    fn promote_same_holder_twice_keeps_length() {
        let mut chain = OwnershipChain::card(UserId(5));
        chain.promote(UserId(7), None);
        let len = chain.len();

        assert_eq!(chain.promote(UserId(7), None), Promotion::AlreadyHolder);
        assert_eq!(chain.len(), len);
    }

    #[test]
    fn returning_owner_is_compacted() {
        let mut chain = OwnershipChain::card(UserId(1));
        chain.promote(UserId(2), Some(snapshot(10)));
        chain.promote(UserId(3), Some(snapshot(20)));
        let outcome = chain.promote(UserId(2), Some(snapshot(30)));

        assert_eq!(outcome, Promotion::Compacted { removed_index: 1 });
        assert_eq!(chain.user_ids(), vec![UserId(1), UserId(3), UserId(2)]);
        // Older snapshot of user 2's first tenure is discarded.
        assert_eq!(chain.holder_record().transfer_message_id, Some(MessageId(30)));
    }

    #[test]
    fn creator_taking_the_card_collapses_chain() {
        let mut chain = OwnershipChain::card(UserId(1));
        chain.promote(UserId(2), None);

        assert_eq!(chain.promote(UserId(1), None), Promotion::CreatorReclaimed);
        assert_eq!(chain.user_ids(), vec![UserId(1)]);
    }

    #[test]
    fn no_duplicates_after_any_promote_sequence() {
        let mut chain = OwnershipChain::card(UserId(1));
        for holder in [2, 3, 2, 4, 3, 3, 1, 4, 2, 5, 4] {
            chain.promote(UserId(holder), None);
            assert!(!has_duplicates(&chain), "duplicate after promoting {holder}");
            assert_eq!(chain.creator(), UserId(1));
        }
    }

    #[test]
    fn demote_is_idempotent() {
        let mut chain = OwnershipChain::card(UserId(1));
        chain.promote(UserId(2), None);
        chain.promote(UserId(3), None);

        assert!(chain.demote());
        let once = chain.clone();
        assert!(!chain.demote());
        assert_eq!(chain, once);
        assert_eq!(chain.user_ids(), vec![UserId(1)]);
    }

    #[test]
    fn previous_owner_detection() {
        let mut chain = OwnershipChain::card(UserId(1));
        chain.promote(UserId(2), None);
        chain.promote(UserId(3), None);

        assert!(chain.is_previous_owner(UserId(2)));
        assert!(!chain.is_previous_owner(UserId(1)));
        assert!(!chain.is_previous_owner(UserId(3)));
        assert!(!chain.is_previous_owner(UserId(9)));
    }

    #[test]
    fn chain_serializes_as_plain_list() {
        let mut chain = OwnershipChain::card(UserId(1));
        chain.promote(UserId(2), None);

        let json = serde_json::to_value(&chain).unwrap();
        assert_eq!(json.as_array().map(|a| a.len()), Some(2));
        let back: OwnershipChain = serde_json::from_value(json).unwrap();
        assert_eq!(back, chain);
        assert!(serde_json::from_str::<OwnershipChain>("[]").is_err());
    }

    #[test]
    fn from_records_rejects_bad_chains() {
        assert_eq!(
            OwnershipChain::from_records(vec![]),
            Err(TypeError::EmptyChain)
        );
        let dup = vec![HolderRecord::new(UserId(1)), HolderRecord::new(UserId(1))];
        assert_eq!(
            OwnershipChain::from_records(dup),
            Err(TypeError::DuplicateHolder(1))
        );
    }
}
