//! Side effects planned inside a state transition and executed after it
//! commits.
//!
//! The engine never talks to live sessions or the push gateway while it
//! writes.  It appends what should happen to an [`EffectList`]; the list runs
//! in insertion order once the transaction is durable.  Every failure here is
//! logged and swallowed.

use tracing::{debug, warn};
use uuid::Uuid;

use trefla_shared::protocol::RealtimeEvent;
use trefla_shared::types::UserId;

use crate::push::{PushMessage, PushSender};
use crate::sessions::SessionRegistry;

#[derive(Debug, Clone)]
pub enum Effect {
    /// Send an event to the user's live session, if any.
    Deliver {
        user_id: UserId,
        session: Option<Uuid>,
        event: RealtimeEvent,
    },
    /// Send a device push.
    Push {
        user_id: UserId,
        device_token: String,
        message: PushMessage,
    },
}

#[derive(Debug, Default)]
pub struct EffectList {
    effects: Vec<Effect>,
}

impl EffectList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliver(&mut self, user_id: UserId, session: Option<Uuid>, event: RealtimeEvent) {
        self.effects.push(Effect::Deliver {
            user_id,
            session,
            event,
        });
    }

    pub fn push(&mut self, user_id: UserId, device_token: &str, message: PushMessage) {
        self.effects.push(Effect::Push {
            user_id,
            device_token: device_token.to_string(),
            message,
        });
    }

    pub fn extend(&mut self, other: EffectList) {
        self.effects.extend(other.effects);
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    /// Execute every effect in order.  Returns how many were carried out.
    pub async fn run(self, sessions: &SessionRegistry, push: &dyn PushSender) -> usize {
        let mut done = 0;
        for effect in self.effects {
            match effect {
                Effect::Deliver {
                    user_id,
                    session,
                    event,
                } => {
                    let Some(session) = session else {
                        debug!(user = %user_id, event = event.name(), "User offline, event dropped");
                        continue;
                    };
                    if !sessions.is_connected(session).await {
                        debug!(
                            user = %user_id,
                            session = %session,
                            event = event.name(),
                            "Session gone, event dropped"
                        );
                        continue;
                    }
                    if sessions.emit_to_session(session, event).await {
                        done += 1;
                    }
                }
                Effect::Push {
                    user_id,
                    device_token,
                    message,
                } => {
                    if device_token.is_empty() {
                        debug!(user = %user_id, "No device token, push skipped");
                        continue;
                    }
                    match push.send(&device_token, &message).await {
                        Ok(()) => done += 1,
                        Err(e) => warn!(user = %user_id, error = %e, "Device push failed"),
                    }
                }
            }
        }
        done
    }
}
