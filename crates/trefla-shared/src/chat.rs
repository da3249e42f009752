//! Chat threads and the relinking rules applied to card chats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chain::{MessageSnapshot, OwnershipChain, Promotion};
use crate::constants::{CREATOR_SLOT, RECEIVER_SLOT};
use crate::types::{AcceptStatus, ChatId, UserId};

/// Per-chat state of the two active participants: slot 0 is the creator,
/// slot 1 the active receiver.  Not indexed by the ownership chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveSlots {
    pub unread_nums: [u32; 2],
    pub online_status: [bool; 2],
}

impl ActiveSlots {
    /// Forget everything known about the receiver side.
    pub fn reset_receiver(&mut self) {
        self.unread_nums[RECEIVER_SLOT] = 0;
        self.online_status[RECEIVER_SLOT] = false;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chat {
    pub id: ChatId,
    pub chain: OwnershipChain,
    pub is_for_card: bool,
    /// Only meaningful when `is_for_card`.
    pub card_number: String,
    /// Whether the chain's last record is a verified holder.
    pub card_verified: bool,
    pub accept_status: AcceptStatus,
    pub slots: ActiveSlots,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    /// A new, unsaved card chat opened by `creator`.
    pub fn new_card(creator: UserId, card_number: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ChatId(0),
            chain: OwnershipChain::card(creator),
            is_for_card: true,
            card_number: card_number.into(),
            card_verified: false,
            accept_status: AcceptStatus::Pending,
            slots: ActiveSlots::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// A new, unsaved direct chat between two users.
    pub fn new_direct(creator: UserId, peer: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: ChatId(0),
            chain: OwnershipChain::direct(creator, peer),
            is_for_card: false,
            card_number: String::new(),
            card_verified: false,
            accept_status: AcceptStatus::Pending,
            slots: ActiveSlots::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn creator(&self) -> UserId {
        self.chain.creator()
    }

    /// Who messages from the creator are addressed to.
    ///
    /// Direct chats: the other participant.  Card chats: the current holder
    /// when verified, otherwise the creator as a pending-review placeholder.
    pub fn active_receiver(&self) -> UserId {
        if !self.is_for_card {
            return self
                .chain
                .records()
                .get(1)
                .map(|r| r.user_id)
                .unwrap_or_else(|| self.chain.creator());
        }
        if self.card_verified {
            self.chain.holder()
        } else {
            self.chain.creator()
        }
    }

    /// Slot index of `user_id` among the two active participants.
    pub fn slot_of(&self, user_id: UserId) -> Option<usize> {
        if user_id == self.creator() {
            Some(CREATOR_SLOT)
        } else if user_id == self.active_receiver() {
            Some(RECEIVER_SLOT)
        } else {
            None
        }
    }

    /// The other active participant as seen by `viewer`, if any.
    pub fn partner_of(&self, viewer: UserId) -> Option<UserId> {
        let creator = self.creator();
        let receiver = self.active_receiver();
        let partner = if viewer == creator { receiver } else { creator };
        (partner != viewer).then_some(partner)
    }

    /// A user who lost the card and must no longer see the thread.
    pub fn is_previous_owner(&self, user_id: UserId) -> bool {
        self.is_for_card
            && self.chain.contains(user_id)
            && self.slot_of(user_id).is_none()
    }

    /// Advance the chain to `new_holder` and mark the card verified.
    ///
    /// Returns `None` for direct chats and when nothing changed.
    pub fn promote(
        &mut self,
        new_holder: UserId,
        snapshot: Option<MessageSnapshot>,
    ) -> Option<Promotion> {
        if !self.is_for_card {
            return None;
        }
        let outcome = self.chain.promote(new_holder, snapshot);
        if outcome == Promotion::AlreadyHolder && self.card_verified {
            return None;
        }
        self.card_verified = true;
        self.slots.reset_receiver();
        self.updated_at = Utc::now();
        Some(outcome)
    }

    /// Roll the chain back to the creator and clear verification.
    ///
    /// Returns `true` if the chat changed.
    pub fn demote(&mut self) -> bool {
        if !self.is_for_card {
            return false;
        }
        let truncated = self.chain.demote();
        let changed = truncated || self.card_verified;
        if changed {
            self.card_verified = false;
            self.slots.reset_receiver();
            self.updated_at = Utc::now();
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_card_chat() -> Chat {
        let mut chat = Chat::new_card(UserId(5), "XYZ");
        chat.id = ChatId(10);
        chat
    }

    #[test]
    fn pending_card_chat_receives_at_creator() {
        let chat = pending_card_chat();
        assert_eq!(chat.active_receiver(), UserId(5));
        assert_eq!(chat.partner_of(UserId(5)), None);
    }

    #[test]
    fn promote_pending_chat_to_new_holder() {
        let mut chat = pending_card_chat();
        let outcome = chat.promote(UserId(7), None);

        assert_eq!(outcome, Some(Promotion::Appended));
        assert_eq!(chat.chain.user_ids(), vec![UserId(5), UserId(7)]);
        assert!(chat.card_verified);
        assert_eq!(chat.active_receiver(), UserId(7));
        assert_eq!(chat.partner_of(UserId(5)), Some(UserId(7)));
        assert_eq!(chat.partner_of(UserId(7)), Some(UserId(5)));
    }

    #[test]
    fn promote_same_holder_is_noop() {
        let mut chat = pending_card_chat();
        chat.promote(UserId(7), None);
        assert_eq!(chat.promote(UserId(7), None), None);
        assert_eq!(chat.chain.len(), 2);
    }

    #[test]
    fn direct_chats_are_never_relinked() {
        let mut chat = Chat::new_direct(UserId(1), UserId(2));
        assert_eq!(chat.promote(UserId(3), None), None);
        assert!(!chat.demote());
        assert_eq!(chat.active_receiver(), UserId(2));
        assert_eq!(chat.partner_of(UserId(2)), Some(UserId(1)));
    }

    #[test]
    fn demote_twice_equals_demote_once() {
        let mut chat = pending_card_chat();
        chat.promote(UserId(7), None);

        assert!(chat.demote());
        let once = chat.chain.clone();
        assert!(!chat.demote());
        assert_eq!(chat.chain, once);
        assert!(!chat.card_verified);
        assert_eq!(chat.active_receiver(), UserId(5));
    }

    #[test]
    fn previous_owner_loses_slot() {
        let mut chat = pending_card_chat();
        chat.promote(UserId(7), None);
        chat.promote(UserId(8), None);

        assert!(chat.is_previous_owner(UserId(7)));
        assert_eq!(chat.slot_of(UserId(7)), None);
        assert_eq!(chat.slot_of(UserId(8)), Some(RECEIVER_SLOT));
    }

    #[test]
    fn creator_verified_for_own_card_stays_consistent() {
        let mut chat = pending_card_chat();
        chat.promote(UserId(7), None);
        chat.demote();

        assert_eq!(chat.promote(UserId(5), None), Some(Promotion::AlreadyHolder));
        assert!(chat.card_verified);
        assert_eq!(chat.active_receiver(), UserId(5));
    }
}
