//! # trefla-shared
//!
//! Domain vocabulary shared by the store and the server: typed identifiers,
//! card and notification enums, the card-chat ownership chain, typed admin
//! permissions and the real-time event payloads pushed to live sessions.

pub mod chain;
pub mod chat;
pub mod constants;
pub mod error;
pub mod permission;
pub mod protocol;
pub mod types;

pub use chain::{HolderRecord, MessageSnapshot, OwnershipChain, Promotion};
pub use chat::{ActiveSlots, Chat};
pub use error::TypeError;
