//! Card ownership engine.
//!
//! Every operation that changes who holds a card runs under that card's
//! lock and advances the card's stored version inside its transaction.  The
//! authoritative writes (user rows, notifications, work items) commit first;
//! chat relinking follows chat by chat; live-session delivery and device
//! pushes are collected into an [`EffectList`] and run after everything is
//! durable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info, warn};

use trefla_shared::constants::{
    CREATOR_SLOT, NO_RECEIVER_ID, PUSH_TITLE_CARD_REJECTED, PUSH_TITLE_CARD_UNVERIFIED,
    PUSH_TITLE_CARD_VERIFIED, RECEIVER_SLOT,
};
use trefla_shared::protocol::{
    CardVerifiedPayload, ChatListUpdate, ChatView, NewMessagePayload, RealtimeEvent,
};
use trefla_shared::types::{
    AcceptStatus, AdminNotificationType, CardStatus, ChatId, NotificationId, NotificationType,
    TransferPayload, UserId,
};
use trefla_store::{
    AdminNotification, Chat, Database, Message, NewNotification, Notification, StoreError, User,
};

use crate::effects::EffectList;
use crate::error::ServerError;
use crate::locks::{CardGuard, CardLocks};
use crate::push::{PushMessage, PushSender};
use crate::relink;
use crate::sessions::SessionRegistry;

pub type SharedDatabase = Arc<Mutex<Database>>;

/// Result of a successful verification.
#[derive(Debug, Serialize)]
pub struct Verification {
    /// The new holder first, then every cleared claimant.
    pub claimants: Vec<User>,
    /// Every card chat of the card after relinking.
    pub chats: Vec<Chat>,
}

/// Result of a rejection or unverification.
#[derive(Debug, Serialize)]
pub struct ClaimWithdrawal {
    pub user: User,
    pub demoted_chats: Vec<ChatId>,
}

#[derive(Debug, Serialize)]
pub struct TransferRequest {
    pub work_item: AdminNotification,
    pub notification: Notification,
}

#[derive(Debug, Serialize)]
pub struct TransferReply {
    pub accepted: bool,
    pub verification: Option<Verification>,
}

#[derive(Debug, Clone)]
enum Withdrawal {
    Reject { reason: String },
    Unverify,
}

#[derive(Clone)]
pub struct CardOwnership {
    db: SharedDatabase,
    sessions: SessionRegistry,
    push: Arc<dyn PushSender>,
    locks: CardLocks,
}

impl CardOwnership {
    pub fn new(db: SharedDatabase, sessions: SessionRegistry, push: Arc<dyn PushSender>) -> Self {
        Self {
            db,
            sessions,
            push,
            locks: CardLocks::new(),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn locks(&self) -> &CardLocks {
        &self.locks
    }

    /// Run `f` against the database.  Never hold the returned value's
    /// borrow across an await.
    pub fn with_db<T>(
        &self,
        f: impl FnOnce(&Database) -> Result<T, ServerError>,
    ) -> Result<T, ServerError> {
        let db = self
            .db
            .lock()
            .map_err(|e| ServerError::Internal(format!("Database lock poisoned: {e}")))?;
        f(&db)
    }

    async fn run(&self, effects: EffectList) {
        if effects.is_empty() {
            return;
        }
        let planned = effects.len();
        let done = effects.run(&self.sessions, self.push.as_ref()).await;
        debug!(planned, done, "Post-commit effects executed");
    }

    // ------------------------------------------------------------------
    // Claim transitions
    // ------------------------------------------------------------------

    /// Make `user_id` the verified holder of the card they claim.  Every
    /// other claimant of the same card loses their claim.
    pub async fn verify(&self, user_id: UserId) -> Result<Verification, ServerError> {
        let card_number = self.with_db(|db| {
            let user = load_user(db, user_id)?;
            ensure_card_info(&user)?;
            Ok(user.card_number)
        })?;

        let guard = self.locks.acquire(&card_number).await;
        let (verification, effects) = self.with_db(|db| verify_locked(db, &guard, user_id))?;
        drop(guard);

        info!(
            user = %user_id,
            card = %card_number,
            cleared = verification.claimants.len() - 1,
            chats = verification.chats.len(),
            "Card verified"
        );
        self.run(effects).await;
        Ok(verification)
    }

    /// Reject the user's card claim with a reason shown to the user.
    pub async fn reject(
        &self,
        user_id: UserId,
        reason: &str,
    ) -> Result<ClaimWithdrawal, ServerError> {
        self.withdraw(
            user_id,
            Withdrawal::Reject {
                reason: reason.trim().to_string(),
            },
        )
        .await
    }

    /// Put the user's claim back to pending.  No notification is stored.
    pub async fn unverify(&self, user_id: UserId) -> Result<ClaimWithdrawal, ServerError> {
        self.withdraw(user_id, Withdrawal::Unverify).await
    }

    async fn withdraw(
        &self,
        user_id: UserId,
        withdrawal: Withdrawal,
    ) -> Result<ClaimWithdrawal, ServerError> {
        let card_number = self.with_db(|db| Ok(load_user(db, user_id)?.card_number))?;

        let guard = self.locks.acquire(&card_number).await;
        let (withdrawn, effects) = self.with_db(|db| {
            let card = guard.card_number();
            let version = db.card_version(card)?;
            let mut effects = EffectList::new();

            let user = db.in_transaction(|db| -> Result<User, ServerError> {
                let mut user = load_user(db, user_id)?;
                ensure_same_card(&user, card)?;
                let was_holder = user.card_verified.is_verified();
                user.card_verified = match &withdrawal {
                    Withdrawal::Reject { .. } => CardStatus::Rejected,
                    Withdrawal::Unverify => CardStatus::Unverified,
                };
                let user = db.save_user(&user)?;

                if let Withdrawal::Reject { reason } = &withdrawal {
                    let kind = NotificationType::CardVerifyReject;
                    let new = NewNotification::system(user.id, kind, card).with_text(reason.as_str());
                    store_notification(db, &user, new, &mut effects)?;
                }
                if !card.is_empty() {
                    let holder = db.verified_holder(card)?.map(|u| u.id);
                    db.advance_card_version(card, version, holder)?;
                }
                debug!(user = %user.id, was_holder, "Claim withdrawn");
                Ok(user)
            })?;

            let demoted_chats = release_card_chats(db, card, &user, &mut effects);

            let message = match &withdrawal {
                Withdrawal::Reject { reason } if !reason.is_empty() => {
                    PushMessage::new(PUSH_TITLE_CARD_REJECTED, reason.as_str())
                }
                Withdrawal::Reject { .. } => PushMessage::new(
                    PUSH_TITLE_CARD_REJECTED,
                    format!("Your card {card} could not be verified"),
                ),
                Withdrawal::Unverify => PushMessage::new(
                    PUSH_TITLE_CARD_UNVERIFIED,
                    format!("Your card {card} is no longer verified"),
                ),
            };
            effects.push(user.id, &user.device_token, message);

            Ok((ClaimWithdrawal { user, demoted_chats }, effects))
        })?;
        drop(guard);

        info!(
            user = %user_id,
            card = %card_number,
            demoted = withdrawn.demoted_chats.len(),
            "Card claim withdrawn"
        );
        self.run(effects).await;
        Ok(withdrawn)
    }

    /// Record a new card submission.  A verified holder submitting again
    /// goes back to pending and gives up the chats of the old card.
    pub async fn submit_card(
        &self,
        user_id: UserId,
        card_number: &str,
        card_img_url: &str,
    ) -> Result<User, ServerError> {
        let card_number = card_number.trim();
        if card_number.is_empty() && card_img_url.trim().is_empty() {
            return Err(ServerError::Validation(
                "A card number or a card image is required".into(),
            ));
        }
        let previous = self.with_db(|db| Ok(load_user(db, user_id)?.card_number))?;

        let guard = self.locks.acquire(&previous).await;
        let (user, effects) = self.with_db(|db| {
            let old_card = guard.card_number();
            let version = db.card_version(old_card)?;
            let mut effects = EffectList::new();

            let (user, was_holder) = db.in_transaction(|db| -> Result<_, ServerError> {
                let current = load_user(db, user_id)?;
                ensure_same_card(&current, old_card)?;
                let was_holder = current.card_verified.is_verified();
                let user = db.submit_card(user_id, card_number, card_img_url)?;
                if was_holder && !old_card.is_empty() {
                    db.advance_card_version(old_card, version, None)?;
                }
                Ok((user, was_holder))
            })?;

            if was_holder {
                release_card_chats(db, old_card, &user, &mut effects);
            }
            Ok((user, effects))
        })?;
        drop(guard);

        info!(user = %user_id, card = %card_number, "Card submitted for review");
        self.run(effects).await;
        Ok(user)
    }

    // ------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------

    /// Ask the current verified holder of `card_number` to hand it over.
    pub async fn request_transfer(
        &self,
        from: UserId,
        card_number: &str,
    ) -> Result<TransferRequest, ServerError> {
        let card = card_number.trim();
        if card.is_empty() {
            return Err(ServerError::Validation("Card number is required".into()));
        }

        let guard = self.locks.acquire(card).await;
        let (request, effects) = self.with_db(|db| {
            let requester = load_user(db, from)?;
            let holder = db
                .verified_holder(card)?
                .ok_or_else(|| ServerError::NotFound(format!("Nobody holds card {card}")))?;
            if holder.id == requester.id {
                return Err(ServerError::Validation("You already hold this card".into()));
            }

            let mut effects = EffectList::new();
            let request = db.in_transaction(|db| -> Result<_, ServerError> {
                let payload = serde_json::to_value(TransferPayload {
                    from: requester.id,
                    to: holder.id,
                    card_number: card.to_string(),
                })
                .map_err(|e| ServerError::Internal(format!("Transfer payload: {e}")))?;
                let work_item =
                    db.create_admin_notification(AdminNotificationType::IdTransfer, &payload)?;

                let kind = NotificationType::CardTransferRequest;
                let new = NewNotification::system(holder.id, kind, card)
                    .from_user(requester.id)
                    .with_text(format!("{} asks to take over card {card}", requester.user_name));
                let notification = store_notification(db, &holder, new, &mut effects)?;

                Ok(TransferRequest {
                    work_item,
                    notification,
                })
            })?;
            Ok((request, effects))
        })?;
        drop(guard);

        info!(from = %from, card = %card, "Card transfer requested");
        self.run(effects).await;
        Ok(request)
    }

    /// The holder's answer to a transfer request notification.
    pub async fn reply_transfer(
        &self,
        holder_id: UserId,
        notification_id: NotificationId,
        accept: bool,
    ) -> Result<TransferReply, ServerError> {
        let (card_number, previous) = self.with_db(|db| {
            let holder = load_user(db, holder_id)?;
            let request = load_notification(db, notification_id)?;
            ensure_transfer_addressee(&holder, &request)?;
            let requester = load_user(db, request.sender_id)?;
            Ok((holder.card_number, requester.card_number))
        })?;

        // a requester holding another card gives it up on accept
        let (guard, previous_guard) = self.locks.acquire_pair(&card_number, &previous).await;
        let (reply, effects) = self.with_db(|db| {
            let card = guard.card_number();
            let holder = load_user(db, holder_id)?;
            let request = load_notification(db, notification_id)?;
            ensure_transfer_addressee(&holder, &request)?;
            let requester = load_user(db, request.sender_id)?;
            let mut effects = EffectList::new();

            if !accept {
                db.in_transaction(|db| -> Result<(), ServerError> {
                    close_transfer_request(db, requester.id, holder.id)?;
                    let new = NewNotification::system(
                        requester.id,
                        NotificationType::CardTransferReject,
                        card,
                    )
                    .from_user(holder.id);
                    store_notification(db, &requester, new, &mut effects)?;
                    Ok(())
                })?;
                let reply = TransferReply {
                    accepted: false,
                    verification: None,
                };
                return Ok((reply, effects));
            }

            ensure_same_card(&requester, &previous)?;
            let released = match &previous_guard {
                Some(old) if requester.card_verified.is_verified() => {
                    let old_card = old.card_number();
                    Some((old_card, db.card_version(old_card)?))
                }
                _ => None,
            };

            let claimant = db.in_transaction(|db| -> Result<_, ServerError> {
                let mut claimant = requester.clone();
                claimant.card_number = card.to_string();
                claimant.card_verified = CardStatus::Unverified;
                let claimant = db.save_user(&claimant)?;
                close_transfer_request(db, claimant.id, holder.id)?;
                if let Some((old_card, version)) = released {
                    db.advance_card_version(old_card, version, None)?;
                }

                let new =
                    NewNotification::system(claimant.id, NotificationType::CardTransferAccept, card)
                        .from_user(holder.id);
                store_notification(db, &claimant, new, &mut effects)?;
                Ok(claimant)
            })?;

            if let Some((old_card, _)) = released {
                release_card_chats(db, old_card, &claimant, &mut effects);
            }
            let (verification, verify_effects) = verify_locked(db, &guard, requester.id)?;
            effects.extend(verify_effects);
            let reply = TransferReply {
                accepted: true,
                verification: Some(verification),
            };
            Ok((reply, effects))
        })?;
        drop(previous_guard);
        drop(guard);

        info!(
            holder = %holder_id,
            card = %card_number,
            accepted = reply.accepted,
            "Card transfer answered"
        );
        self.run(effects).await;
        Ok(reply)
    }

    // ------------------------------------------------------------------
    // Chats
    // ------------------------------------------------------------------

    /// Find or open the sender's chat with whoever holds `card_number`.
    pub async fn open_card_chat(
        &self,
        sender_id: UserId,
        card_number: &str,
    ) -> Result<ChatView, ServerError> {
        let card = card_number.trim();
        if card.is_empty() {
            return Err(ServerError::Validation("Card number is required".into()));
        }

        let guard = self.locks.acquire(card).await;
        let (view, effects) = self.with_db(|db| {
            let sender = load_user(db, sender_id)?;
            let holder = db.verified_holder(card)?;
            if holder.as_ref().is_some_and(|h| h.id == sender.id) {
                return Err(ServerError::Validation(
                    "You cannot open a chat with your own card".into(),
                ));
            }

            let mut effects = EffectList::new();
            let chat = match db.card_chat_of_creator(sender.id, card)? {
                Some(chat) => chat,
                None => {
                    let chat = db.create_chat(&Chat::new_card(sender.id, card))?;
                    info!(chat = %chat.id, creator = %sender.id, card = %card, "Card chat opened");
                    match &holder {
                        Some(holder) => {
                            let (chat, _) = relink::promote_chat(db, chat, holder.id)?;
                            let view = chat_view(db, &chat, holder.id)?;
                            effects.deliver(
                                holder.id,
                                holder.socket_id,
                                RealtimeEvent::ChatListUpdated(ChatListUpdate {
                                    added: vec![view],
                                    removed: vec![],
                                }),
                            );
                            chat
                        }
                        None => chat,
                    }
                }
            };
            Ok((chat_view(db, &chat, sender.id)?, effects))
        })?;
        drop(guard);

        self.run(effects).await;
        Ok(view)
    }

    pub async fn send_message(
        &self,
        chat_id: ChatId,
        sender_id: UserId,
        text: &str,
    ) -> Result<Message, ServerError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ServerError::Validation("Message text is required".into()));
        }

        let (message, effects) = self.with_db(|db| {
            let mut chat = db.get_chat(chat_id).map_err(|e| match e {
                StoreError::NotFound => ServerError::NotFound(format!("Chat {chat_id} not found")),
                other => other.into(),
            })?;
            if chat.is_previous_owner(sender_id) {
                return Err(ServerError::Permission(
                    "You no longer hold the card of this chat".into(),
                ));
            }
            let Some(slot) = chat.slot_of(sender_id) else {
                return Err(ServerError::Permission(
                    "You are not a participant of this chat".into(),
                ));
            };
            let receiver = chat.partner_of(sender_id);

            let message = db.in_transaction(|db| -> Result<Message, ServerError> {
                let message = db.insert_message(
                    chat.id,
                    sender_id,
                    receiver.unwrap_or(UserId(NO_RECEIVER_ID)),
                    text,
                )?;
                if receiver.is_some() {
                    let other = if slot == CREATOR_SLOT { RECEIVER_SLOT } else { CREATOR_SLOT };
                    chat.slots.unread_nums[other] += 1;
                }
                if slot == RECEIVER_SLOT && chat.accept_status == AcceptStatus::Pending {
                    chat.accept_status = AcceptStatus::Accepted;
                }
                chat.updated_at = message.created_at;
                db.save_chat(&chat)?;
                Ok(message)
            })?;

            let mut effects = EffectList::new();
            if let Some(receiver) = receiver {
                match db.get_user(receiver) {
                    Ok(user) => effects.deliver(
                        user.id,
                        user.socket_id,
                        RealtimeEvent::NewMessage(NewMessagePayload {
                            chat_id: message.chat_id,
                            message_id: message.id,
                            sender_id: message.sender_id,
                            text: message.message.clone(),
                            sent_at: message.created_at,
                        }),
                    ),
                    Err(e) => warn!(user = %receiver, error = %e, "Message receiver not loadable"),
                }
            }
            Ok((message, effects))
        })?;

        self.run(effects).await;
        Ok(message)
    }

    /// The chats `user_id` should see, each with the partner's profile.
    pub fn chat_summary(&self, user_id: UserId) -> Result<Vec<ChatView>, ServerError> {
        self.with_db(|db| {
            load_user(db, user_id)?;
            let chats: Vec<Chat> = db
                .chats_for_user(user_id)?
                .into_iter()
                .filter(|chat| visible_to(chat, user_id))
                .collect();
            chat_views(db, &chats, user_id)
        })
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    pub fn mark_notifications_read(&self, user_id: UserId) -> Result<(), ServerError> {
        self.with_db(|db| {
            if !db.reset_noti_num(user_id)? {
                return Err(ServerError::NotFound(format!("User {user_id} not found")));
            }
            Ok(())
        })
    }
}

/// Verification with the card lock already held.  Shared by `verify` and an
/// accepted transfer.
fn verify_locked(
    db: &Database,
    guard: &CardGuard,
    user_id: UserId,
) -> Result<(Verification, EffectList), ServerError> {
    let card = guard.card_number();
    let version = db.card_version(card)?;
    let mut effects = EffectList::new();

    let (winner, losers) = db.in_transaction(|db| -> Result<_, ServerError> {
        let mut winner = load_user(db, user_id)?;
        ensure_card_info(&winner)?;
        ensure_same_card(&winner, card)?;

        let mut losers = Vec::new();
        for mut other in db.users_by_card(card, false)? {
            if other.id == winner.id {
                continue;
            }
            other.clear_card_claim();
            losers.push(db.save_user(&other)?);
        }
        winner.card_verified = CardStatus::Verified;
        let winner = db.save_user(&winner)?;

        for loser in &losers {
            let new = NewNotification::system(loser.id, NotificationType::CardVerifyReject, card)
                .with_text("Another user was verified as the holder of this card");
            store_notification(db, loser, new, &mut effects)?;
        }
        let new = NewNotification::system(winner.id, NotificationType::CardVerifyAccept, card);
        store_notification(db, &winner, new, &mut effects)?;

        if !card.is_empty() {
            db.advance_card_version(card, version, Some(winner.id))?;
        }
        Ok((winner, losers))
    })?;

    let report = relink::promote_card_chats(db, card, winner.id);
    if !report.failed.is_empty() {
        warn!(card = %card, failed = ?report.failed, "Some card chats were not relinked");
    }
    if let Err(e) = fanout_verified(db, card, &winner, &losers, &report, &mut effects) {
        warn!(card = %card, error = %e, "Chat list fanout skipped");
    }
    effects.push(
        winner.id,
        &winner.device_token,
        PushMessage::new(
            PUSH_TITLE_CARD_VERIFIED,
            format!("Your card {card} has been verified"),
        ),
    );

    let mut claimants = Vec::with_capacity(losers.len() + 1);
    claimants.push(winner);
    claimants.extend(losers);
    Ok((
        Verification {
            claimants,
            chats: report.chats,
        },
        effects,
    ))
}

fn fanout_verified(
    db: &Database,
    card: &str,
    winner: &User,
    losers: &[User],
    report: &relink::RelinkReport,
    effects: &mut EffectList,
) -> Result<(), ServerError> {
    effects.deliver(
        winner.id,
        winner.socket_id,
        RealtimeEvent::ChatListUpdated(ChatListUpdate {
            added: chat_views(db, &report.chats, winner.id)?,
            removed: vec![],
        }),
    );
    effects.deliver(
        winner.id,
        winner.socket_id,
        RealtimeEvent::CardVerified(CardVerifiedPayload {
            card_number: card.to_string(),
            chat_ids: report.chat_ids(),
        }),
    );

    for loser in losers {
        let removed: Vec<ChatId> = report
            .chats
            .iter()
            .filter(|chat| chat.creator() != loser.id)
            .map(|chat| chat.id)
            .collect();
        if !removed.is_empty() {
            effects.deliver(
                loser.id,
                loser.socket_id,
                RealtimeEvent::ChatListUpdated(ChatListUpdate {
                    added: vec![],
                    removed,
                }),
            );
        }
    }

    announce_to_creators(db, report, winner.id, effects)
}

/// Demote the card's chats unless another verified holder still owns it.
/// Returns the ids of the chats that changed.
fn release_card_chats(
    db: &Database,
    card: &str,
    user: &User,
    effects: &mut EffectList,
) -> Vec<ChatId> {
    if card.is_empty() {
        return Vec::new();
    }
    match db.verified_holder(card) {
        Ok(Some(holder)) => {
            debug!(card = %card, holder = %holder.id, "Card still held, chats left linked");
            return Vec::new();
        }
        Ok(None) => {}
        Err(e) => {
            warn!(card = %card, error = %e, "Could not check card holder, chats left linked");
            return Vec::new();
        }
    }

    let report = relink::demote_card_chats(db, card);
    let removed: Vec<ChatId> = report
        .chats
        .iter()
        .filter(|chat| report.changed.contains(&chat.id) && chat.creator() != user.id)
        .map(|chat| chat.id)
        .collect();
    if !removed.is_empty() {
        effects.deliver(
            user.id,
            user.socket_id,
            RealtimeEvent::ChatListUpdated(ChatListUpdate {
                added: vec![],
                removed,
            }),
        );
    }
    if let Err(e) = announce_to_creators(db, &report, user.id, effects) {
        warn!(card = %card, error = %e, "Creator fanout skipped");
    }
    report.changed
}

/// Tell the creator of every changed chat about its new partner.
fn announce_to_creators(
    db: &Database,
    report: &relink::RelinkReport,
    skip: UserId,
    effects: &mut EffectList,
) -> Result<(), ServerError> {
    let changed: Vec<&Chat> = report
        .chats
        .iter()
        .filter(|chat| report.changed.contains(&chat.id) && chat.creator() != skip)
        .collect();
    if changed.is_empty() {
        return Ok(());
    }

    let creator_ids: Vec<UserId> = changed.iter().map(|chat| chat.creator()).collect();
    let creators: HashMap<UserId, User> = db
        .users_by_ids(&creator_ids)?
        .into_iter()
        .map(|u| (u.id, u))
        .collect();

    for chat in changed {
        let Some(creator) = creators.get(&chat.creator()) else {
            continue;
        };
        effects.deliver(
            creator.id,
            creator.socket_id,
            RealtimeEvent::ChatListUpdated(ChatListUpdate {
                added: vec![chat_view(db, chat, creator.id)?],
                removed: vec![],
            }),
        );
    }
    Ok(())
}

fn visible_to(chat: &Chat, user_id: UserId) -> bool {
    if chat.is_previous_owner(user_id) || chat.slot_of(user_id).is_none() {
        return false;
    }
    // A pending chat shows up for the side that has to answer it.
    !(chat.accept_status == AcceptStatus::Pending && chat.creator() == user_id)
}

fn chat_view(db: &Database, chat: &Chat, viewer: UserId) -> Result<ChatView, ServerError> {
    let partner = match chat.partner_of(viewer) {
        Some(id) => db.users_by_ids(&[id])?.into_iter().next().map(|u| u.summary()),
        None => None,
    };
    Ok(ChatView {
        chat: chat.clone(),
        partner,
    })
}

fn chat_views(db: &Database, chats: &[Chat], viewer: UserId) -> Result<Vec<ChatView>, ServerError> {
    let partner_ids: Vec<UserId> = chats.iter().filter_map(|c| c.partner_of(viewer)).collect();
    let partners: HashMap<UserId, User> = db
        .users_by_ids(&partner_ids)?
        .into_iter()
        .map(|u| (u.id, u))
        .collect();

    Ok(chats
        .iter()
        .map(|chat| ChatView {
            chat: chat.clone(),
            partner: chat
                .partner_of(viewer)
                .and_then(|id| partners.get(&id))
                .map(User::summary),
        })
        .collect())
}

/// Store a notification, bump the receiver's unread counter and plan its
/// delivery.
fn store_notification(
    db: &Database,
    receiver: &User,
    new: NewNotification,
    effects: &mut EffectList,
) -> Result<Notification, ServerError> {
    let notification = db.create_notification(&new)?;
    let noti_num = db.increment_noti_num(receiver.id)?;
    effects.deliver(
        receiver.id,
        receiver.socket_id,
        RealtimeEvent::Notification(notification.payload(noti_num)),
    );
    Ok(notification)
}

fn load_user(db: &Database, id: UserId) -> Result<User, ServerError> {
    db.get_user(id).map_err(|e| match e {
        StoreError::NotFound => ServerError::NotFound(format!("User {id} not found")),
        other => other.into(),
    })
}

fn load_notification(db: &Database, id: NotificationId) -> Result<Notification, ServerError> {
    db.get_notification(id).map_err(|e| match e {
        StoreError::NotFound => ServerError::NotFound(format!("Notification {id} not found")),
        other => other.into(),
    })
}

fn ensure_card_info(user: &User) -> Result<(), ServerError> {
    if user.has_card_info() {
        Ok(())
    } else {
        Err(ServerError::Validation(format!(
            "User {} has not submitted card information",
            user.id
        )))
    }
}

/// The claim must not have moved to another card while we waited for the
/// card lock.
fn ensure_same_card(user: &User, card: &str) -> Result<(), ServerError> {
    if user.card_number == card {
        Ok(())
    } else {
        Err(ServerError::Conflict(format!(
            "Card claim of user {} changed concurrently, try again",
            user.id
        )))
    }
}

/// Remove the open work item for a transfer; an answered request has none.
fn close_transfer_request(db: &Database, from: UserId, to: UserId) -> Result<(), ServerError> {
    if db.delete_transfer_request(from, to)? == 0 {
        return Err(ServerError::Permission(
            "This transfer request was already answered".into(),
        ));
    }
    Ok(())
}

fn ensure_transfer_addressee(holder: &User, request: &Notification) -> Result<(), ServerError> {
    let addressed = request.kind == NotificationType::CardTransferRequest
        && request.receiver_id == holder.id
        && holder.card_verified.is_verified()
        && !holder.card_number.is_empty()
        && request.optional_val == holder.card_number;
    if addressed {
        Ok(())
    } else {
        Err(ServerError::Permission(
            "This transfer request is not addressed to the holder of the card".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::testing::RecordingPush;

    fn engine() -> (CardOwnership, Arc<RecordingPush>) {
        let db = Database::open_in_memory().unwrap();
        let push = Arc::new(RecordingPush::default());
        let engine = CardOwnership::new(
            Arc::new(Mutex::new(db)),
            SessionRegistry::default(),
            push.clone(),
        );
        (engine, push)
    }

    fn claimant(engine: &CardOwnership, name: &str, card: &str) -> UserId {
        engine
            .with_db(|db| {
                let user = db.create_user(name, &format!("{name}@example.com"))?;
                db.set_device_token(user.id, &format!("device-{name}"))?;
                if !card.is_empty() {
                    db.submit_card(user.id, card, "https://img.example.com/card.jpg")?;
                }
                Ok(user.id)
            })
            .unwrap()
    }

    fn user(engine: &CardOwnership, id: UserId) -> User {
        engine.with_db(|db| Ok(db.get_user(id)?)).unwrap()
    }

    fn notifications(engine: &CardOwnership, id: UserId) -> Vec<Notification> {
        engine
            .with_db(|db| Ok(db.notifications_for_user(id, 50)?))
            .unwrap()
    }

    fn card_chat(engine: &CardOwnership, creator: UserId, card: &str) -> Chat {
        engine
            .with_db(|db| Ok(db.create_chat(&Chat::new_card(creator, card))?))
            .unwrap()
    }

    fn reload(engine: &CardOwnership, chat: &Chat) -> Chat {
        engine.with_db(|db| Ok(db.get_chat(chat.id)?)).unwrap()
    }

    fn verified_holders(engine: &CardOwnership, card: &str) -> Vec<UserId> {
        engine
            .with_db(|db| Ok(db.users_by_card(card, true)?))
            .unwrap()
            .into_iter()
            .map(|u| u.id)
            .collect()
    }

    fn assert_receivers_consistent(engine: &CardOwnership, card: &str) {
        let holder = verified_holders(engine, card).first().copied();
        let chats = engine.with_db(|db| Ok(db.chats_for_card(card)?)).unwrap();
        for chat in chats {
            assert_eq!(chat.active_receiver(), holder.unwrap_or(chat.creator()));
        }
    }

    #[tokio::test]
    async fn scenario_a_winner_takes_all() {
        let (engine, push) = engine();
        let one = claimant(&engine, "one", "ABC123");
        let two = claimant(&engine, "two", "ABC123");

        let verification = engine.verify(one).await.unwrap();
        assert_eq!(verification.claimants.len(), 2);

        let one = user(&engine, one);
        let two = user(&engine, two);
        assert_eq!(one.card_verified, CardStatus::Verified);
        assert_eq!(two.card_verified, CardStatus::Unverified);
        assert!(two.card_number.is_empty());
        assert!(two.card_img_url.is_empty());
        assert_eq!(verified_holders(&engine, "ABC123"), vec![one.id]);

        let accept = notifications(&engine, one.id);
        let reject = notifications(&engine, two.id);
        assert_eq!(accept.len(), 1);
        assert_eq!(accept[0].kind, NotificationType::CardVerifyAccept);
        assert_eq!(accept[0].optional_val, "ABC123");
        assert_eq!(reject.len(), 1);
        assert_eq!(reject[0].kind, NotificationType::CardVerifyReject);
        assert_eq!((one.noti_num, two.noti_num), (1, 1));

        assert_eq!(push.titles(), vec![PUSH_TITLE_CARD_VERIFIED.to_string()]);
    }

    #[tokio::test]
    async fn scenario_b_pending_chat_is_promoted() {
        let (engine, _) = engine();
        let creator = claimant(&engine, "five", "");
        let holder = claimant(&engine, "seven", "XYZ");
        let chat = card_chat(&engine, creator, "XYZ");
        assert_eq!(chat.active_receiver(), creator);

        let verification = engine.verify(holder).await.unwrap();
        assert_eq!(verification.chats.len(), 1);

        let chat = reload(&engine, &chat);
        assert_eq!(chat.chain.user_ids(), vec![creator, holder]);
        assert!(chat.card_verified);
        assert_eq!(chat.active_receiver(), holder);
    }

    #[tokio::test]
    async fn scenario_c_accepted_transfer_moves_the_card() {
        let (engine, _) = engine();
        let holder = claimant(&engine, "nine", "Q1");
        let requester = claimant(&engine, "four", "");
        let creator = claimant(&engine, "writer", "");
        let chat = card_chat(&engine, creator, "Q1");
        engine.verify(holder).await.unwrap();

        let request = engine.request_transfer(requester, "Q1").await.unwrap();
        assert_eq!(request.notification.receiver_id, holder);
        assert_eq!(request.notification.optional_val, "Q1");
        assert_eq!(user(&engine, holder).noti_num, 2);

        let reply = engine
            .reply_transfer(holder, request.notification.id, true)
            .await
            .unwrap();
        assert!(reply.accepted);

        assert_eq!(verified_holders(&engine, "Q1"), vec![requester]);
        let old = user(&engine, holder);
        assert!(old.card_number.is_empty());
        assert!(!old.card_verified.is_verified());

        let chat = reload(&engine, &chat);
        assert_eq!(chat.chain.user_ids(), vec![creator, holder, requester]);
        assert_eq!(chat.active_receiver(), requester);
        assert!(chat.is_previous_owner(holder));

        let kinds: Vec<_> = notifications(&engine, requester).iter().map(|n| n.kind).collect();
        assert!(kinds.contains(&NotificationType::CardTransferAccept));
        assert!(kinds.contains(&NotificationType::CardVerifyAccept));

        let left = engine
            .with_db(|db| Ok(db.list_admin_notifications(AdminNotificationType::IdTransfer)?))
            .unwrap();
        assert!(left.is_empty());
    }

    #[tokio::test]
    async fn scenario_d_reject_without_chats() {
        let (engine, push) = engine();
        let id = claimant(&engine, "three", "R1");

        let withdrawn = engine.reject(id, "blurry photo").await.unwrap();
        assert!(withdrawn.demoted_chats.is_empty());
        assert_eq!(withdrawn.user.card_verified, CardStatus::Rejected);

        let notes = notifications(&engine, id);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].kind, NotificationType::CardVerifyReject);
        assert_eq!(notes[0].text, "blurry photo");
        assert_eq!(push.titles(), vec![PUSH_TITLE_CARD_REJECTED.to_string()]);
    }

    #[tokio::test]
    async fn rejected_transfer_only_notifies() {
        let (engine, _) = engine();
        let holder = claimant(&engine, "holder", "T1");
        let requester = claimant(&engine, "asker", "");
        engine.verify(holder).await.unwrap();

        let request = engine.request_transfer(requester, "T1").await.unwrap();
        let reply = engine
            .reply_transfer(holder, request.notification.id, false)
            .await
            .unwrap();

        assert!(!reply.accepted);
        assert!(reply.verification.is_none());
        assert_eq!(verified_holders(&engine, "T1"), vec![holder]);
        let kinds: Vec<_> = notifications(&engine, requester).iter().map(|n| n.kind).collect();
        assert_eq!(kinds, vec![NotificationType::CardTransferReject]);
    }

    #[tokio::test]
    async fn rejected_transfer_cannot_be_accepted_later() {
        let (engine, _) = engine();
        let holder = claimant(&engine, "holder", "T2");
        let requester = claimant(&engine, "asker", "");
        engine.verify(holder).await.unwrap();

        let request = engine.request_transfer(requester, "T2").await.unwrap();
        let id = request.notification.id;
        engine.reply_transfer(holder, id, false).await.unwrap();

        let err = engine.reply_transfer(holder, id, true).await.unwrap_err();
        assert!(matches!(err, ServerError::Permission(_)));
        assert_eq!(verified_holders(&engine, "T2"), vec![holder]);
        let asker = user(&engine, requester);
        assert!(asker.card_number.is_empty());
        let kinds: Vec<_> = notifications(&engine, requester).iter().map(|n| n.kind).collect();
        assert_eq!(kinds, vec![NotificationType::CardTransferReject]);

        let err = engine.reply_transfer(holder, id, false).await.unwrap_err();
        assert!(matches!(err, ServerError::Permission(_)));
    }

    #[tokio::test]
    async fn accepted_transfer_releases_the_requesters_old_card() {
        let (engine, _) = engine();
        let holder = claimant(&engine, "holder", "NEW1");
        let requester = claimant(&engine, "asker", "OLD1");
        let creator = claimant(&engine, "writer", "");
        let chat = card_chat(&engine, creator, "OLD1");
        engine.verify(holder).await.unwrap();
        engine.verify(requester).await.unwrap();
        assert_eq!(reload(&engine, &chat).active_receiver(), requester);

        let request = engine.request_transfer(requester, "NEW1").await.unwrap();
        let reply = engine
            .reply_transfer(holder, request.notification.id, true)
            .await
            .unwrap();
        assert!(reply.accepted);

        assert_eq!(verified_holders(&engine, "NEW1"), vec![requester]);
        assert!(verified_holders(&engine, "OLD1").is_empty());
        let chat = reload(&engine, &chat);
        assert_eq!(chat.chain.user_ids(), vec![creator]);
        assert!(!chat.card_verified);
        assert_receivers_consistent(&engine, "OLD1");
        assert_receivers_consistent(&engine, "NEW1");

        let (version, claimed_by) = engine
            .with_db(|db| Ok((db.card_version("OLD1")?, db.card_holder("OLD1")?)))
            .unwrap();
        assert_eq!(version, 2);
        assert_eq!(claimed_by, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_verifies_leave_one_holder() {
        let (engine, _) = engine();
        let creator = claimant(&engine, "writer", "");
        let one = claimant(&engine, "one", "RACE1");
        let two = claimant(&engine, "two", "RACE1");
        let chat = card_chat(&engine, creator, "RACE1");

        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.verify(one).await }
        });
        let second = tokio::spawn({
            let engine = engine.clone();
            async move { engine.verify(two).await }
        });
        let (first, second) = tokio::join!(first, second);
        let results = [first.unwrap(), second.unwrap()];

        // the loser's claim is cleared by the winner
        let won: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
        assert_eq!(won.len(), 1);
        for result in &results {
            if let Err(err) = result {
                assert!(matches!(
                    err,
                    ServerError::Validation(_) | ServerError::Conflict(_)
                ));
            }
        }

        let holders = verified_holders(&engine, "RACE1");
        assert_eq!(holders.len(), 1);
        assert_receivers_consistent(&engine, "RACE1");
        assert_eq!(reload(&engine, &chat).chain.user_ids(), vec![creator, holders[0]]);
        let version = engine.with_db(|db| Ok(db.card_version("RACE1")?)).unwrap();
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn verify_needs_card_info_and_writes_nothing() {
        let (engine, _) = engine();
        let id = claimant(&engine, "blank", "");

        let err = engine.verify(id).await.unwrap_err();
        assert!(matches!(err, ServerError::Validation(_)));
        assert!(notifications(&engine, id).is_empty());
        assert_eq!(user(&engine, id).card_verified, CardStatus::Unverified);
    }

    #[tokio::test]
    async fn transfer_request_needs_a_holder() {
        let (engine, _) = engine();
        let id = claimant(&engine, "asker", "");

        let err = engine.request_transfer(id, "NOBODY").await.unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));
        let items = engine
            .with_db(|db| Ok(db.list_admin_notifications(AdminNotificationType::IdTransfer)?))
            .unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn only_the_holder_can_answer_a_transfer() {
        let (engine, _) = engine();
        let holder = claimant(&engine, "holder", "P1");
        let requester = claimant(&engine, "asker", "");
        let stranger = claimant(&engine, "stranger", "");
        engine.verify(holder).await.unwrap();
        let request = engine.request_transfer(requester, "P1").await.unwrap();

        let err = engine
            .reply_transfer(stranger, request.notification.id, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Permission(_)));

        engine.unverify(holder).await.unwrap();
        let err = engine
            .reply_transfer(holder, request.notification.id, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Permission(_)));
    }

    #[tokio::test]
    async fn unverify_demotes_and_is_repeatable() {
        let (engine, push) = engine();
        let creator = claimant(&engine, "creator", "");
        let holder = claimant(&engine, "holder", "U1");
        let chat = card_chat(&engine, creator, "U1");
        engine.verify(holder).await.unwrap();

        let withdrawn = engine.unverify(holder).await.unwrap();
        assert_eq!(withdrawn.demoted_chats, vec![chat.id]);
        let once = reload(&engine, &chat);
        assert_eq!(once.chain.user_ids(), vec![creator]);
        assert!(!once.card_verified);

        let again = engine.unverify(holder).await.unwrap();
        assert!(again.demoted_chats.is_empty());
        assert_eq!(reload(&engine, &chat), once);
        assert_receivers_consistent(&engine, "U1");

        assert_eq!(notifications(&engine, holder).len(), 1);
        assert!(push.titles().contains(&PUSH_TITLE_CARD_UNVERIFIED.to_string()));
    }

    #[tokio::test]
    async fn rejecting_a_pending_claimant_keeps_holder_chats() {
        let (engine, _) = engine();
        let creator = claimant(&engine, "creator", "");
        let holder = claimant(&engine, "holder", "K1");
        let chat = card_chat(&engine, creator, "K1");
        engine.verify(holder).await.unwrap();

        // late claimant
        let late = claimant(&engine, "late", "K1");
        let withdrawn = engine.reject(late, "duplicate").await.unwrap();

        assert!(withdrawn.demoted_chats.is_empty());
        assert_eq!(reload(&engine, &chat).active_receiver(), holder);
        assert_receivers_consistent(&engine, "K1");
    }

    #[tokio::test]
    async fn ownership_hops_keep_invariants() {
        let (engine, _) = engine();
        let creator = claimant(&engine, "creator", "");
        let a = claimant(&engine, "a", "");
        let b = claimant(&engine, "b", "");
        let chat = card_chat(&engine, creator, "H1");

        for next in [a, b, a, b, b] {
            engine.submit_card(next, "H1", "img").await.unwrap();
            engine.verify(next).await.unwrap();

            assert_eq!(verified_holders(&engine, "H1"), vec![next]);
            assert_receivers_consistent(&engine, "H1");
            let chain = reload(&engine, &chat).chain.user_ids();
            let mut unique = chain.clone();
            unique.sort();
            unique.dedup();
            assert_eq!(unique.len(), chain.len(), "duplicate holder in {chain:?}");
            assert_eq!(chain[0], creator);
        }
        // holder re-submits
        assert_eq!(reload(&engine, &chat).chain.user_ids(), vec![creator, b]);
    }

    #[tokio::test]
    async fn previous_owner_cannot_write_or_see_the_chat() {
        let (engine, _) = engine();
        let creator = claimant(&engine, "creator", "");
        let first = claimant(&engine, "first", "M1");
        let second = claimant(&engine, "second", "");

        let view = engine.open_card_chat(creator, "M1").await.unwrap();
        assert!(view.partner.is_none());
        engine.verify(first).await.unwrap();
        let chat_id = view.chat.id;

        engine.send_message(chat_id, creator, "hello").await.unwrap();
        let reply = engine.send_message(chat_id, first, "hi!").await.unwrap();
        assert_eq!(reply.receiver_id, creator);

        engine.submit_card(second, "M1", "img").await.unwrap();
        engine.verify(second).await.unwrap();

        let err = engine.send_message(chat_id, first, "still mine?").await.unwrap_err();
        assert!(matches!(err, ServerError::Permission(_)));
        assert!(engine.chat_summary(first).unwrap().is_empty());

        let seen_by_second = engine.chat_summary(second).unwrap();
        assert_eq!(seen_by_second.len(), 1);
        assert_eq!(seen_by_second[0].partner.as_ref().map(|p| p.id), Some(creator));

        let msg = engine.send_message(chat_id, creator, "who is this?").await.unwrap();
        assert_eq!(msg.receiver_id, second);
    }

    #[tokio::test]
    async fn opening_a_chat_links_the_current_holder() {
        let (engine, _) = engine();
        let holder = claimant(&engine, "holder", "O1");
        let sender = claimant(&engine, "sender", "");
        engine.verify(holder).await.unwrap();

        let view = engine.open_card_chat(sender, "O1").await.unwrap();
        assert_eq!(view.chat.active_receiver(), holder);
        assert_eq!(view.partner.map(|p| p.id), Some(holder));

        let again = engine.open_card_chat(sender, "O1").await.unwrap();
        assert_eq!(again.chat.id, view.chat.id);

        // pending: answering side only
        assert!(engine.chat_summary(sender).unwrap().is_empty());
        assert_eq!(engine.chat_summary(holder).unwrap().len(), 1);

        let err = engine.open_card_chat(holder, "O1").await.unwrap_err();
        assert!(matches!(err, ServerError::Validation(_)));
    }

    #[tokio::test]
    async fn message_into_pending_chat_has_no_receiver() {
        let (engine, _) = engine();
        let sender = claimant(&engine, "sender", "");
        let view = engine.open_card_chat(sender, "NOHOLDER").await.unwrap();

        let msg = engine.send_message(view.chat.id, sender, "anyone?").await.unwrap();
        assert_eq!(msg.receiver_id, UserId(NO_RECEIVER_ID));

        let err = engine.send_message(view.chat.id, sender, "   ").await.unwrap_err();
        assert!(matches!(err, ServerError::Validation(_)));
    }

    #[tokio::test]
    async fn live_sessions_receive_events_after_commit() {
        let (engine, _) = engine();
        let winner = claimant(&engine, "winner", "L1");
        let loser = claimant(&engine, "loser", "L1");
        let creator = claimant(&engine, "creator", "");
        card_chat(&engine, creator, "L1");

        let (winner_session, mut winner_rx) = engine.sessions().register(winner).await;
        let (loser_session, mut loser_rx) = engine.sessions().register(loser).await;
        engine
            .with_db(|db| {
                db.set_socket_id(winner, Some(winner_session))?;
                db.set_socket_id(loser, Some(loser_session))?;
                Ok(())
            })
            .unwrap();

        engine.verify(winner).await.unwrap();

        let mut names = Vec::new();
        while let Ok(event) = winner_rx.try_recv() {
            names.push(event.name());
        }
        assert_eq!(names, vec!["notification", "chat_list_updated", "card_verified"]);

        let mut loser_events = Vec::new();
        while let Ok(event) = loser_rx.try_recv() {
            loser_events.push(event);
        }
        assert_eq!(loser_events.len(), 2);
        match &loser_events[1] {
            RealtimeEvent::ChatListUpdated(update) => assert_eq!(update.removed.len(), 1),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn verified_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trefla.db");
        let (holder, chat_id) = {
            let db = Database::open_at(&path).unwrap();
            let engine = CardOwnership::new(
                Arc::new(Mutex::new(db)),
                SessionRegistry::default(),
                Arc::new(RecordingPush::default()),
            );
            let creator = claimant(&engine, "creator", "");
            let holder = claimant(&engine, "holder", "DISK1");
            let chat = card_chat(&engine, creator, "DISK1");
            engine.verify(holder).await.unwrap();
            (holder, chat.id)
        };

        let db = Database::open_at(&path).unwrap();
        assert_eq!(db.verified_holder("DISK1").unwrap().map(|u| u.id), Some(holder));
        assert_eq!(db.card_holder("DISK1").unwrap(), Some(holder));
        assert_eq!(db.card_version("DISK1").unwrap(), 1);
        assert_eq!(db.get_chat(chat_id).unwrap().active_receiver(), holder);
    }

    #[tokio::test]
    async fn notifications_can_be_marked_read() {
        let (engine, _) = engine();
        let id = claimant(&engine, "reader", "N1");
        engine.verify(id).await.unwrap();
        assert_eq!(user(&engine, id).noti_num, 1);

        engine.mark_notifications_read(id).unwrap();
        assert_eq!(user(&engine, id).noti_num, 0);
        assert!(matches!(
            engine.mark_notifications_read(UserId(999)),
            Err(ServerError::NotFound(_))
        ));
    }
}
