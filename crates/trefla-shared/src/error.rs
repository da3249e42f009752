use thiserror::Error;

/// Errors raised when decoding stored codes or caller-supplied names into
/// the typed domain vocabulary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("Unknown card status code: {0}")]
    UnknownCardStatus(i64),

    #[error("Unknown notification type code: {0}")]
    UnknownNotificationType(i64),

    #[error("Unknown admin notification type: {0}")]
    UnknownAdminNotificationType(String),

    #[error("Unknown admin role: {0}")]
    UnknownAdminRole(String),

    #[error("Unknown permission path: {0}")]
    UnknownPermission(String),

    #[error("Ownership chain must contain at least the creator")]
    EmptyChain,

    #[error("Ownership chain lists user {0} more than once")]
    DuplicateHolder(i64),
}
