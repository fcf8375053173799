use thiserror::Error;
use tossup_core::{Stake, TossupError};

pub type Result<T> = std::result::Result<T, TossError>;

#[derive(Error, Debug)]
pub enum TossError {
    #[error("Core error: {0}")]
    Core(#[from] TossupError),

    #[error("Toss not found: {0}")]
    TossNotFound(String),

    #[error("Invalid toss state: {0}")]
    InvalidState(String),

    #[error("You have already joined toss {0}")]
    AlreadyJoined(String),

    #[error("'{option}' is not an option for toss {id}")]
    UnknownOption { id: String, option: String },

    #[error("Toss {id} needs at least 2 participants, has {have}")]
    NotEnoughParticipants { id: String, have: usize },

    #[error("Only the creator can close toss {0}")]
    NotCreator(String),

    #[error("Payment must be confirmed before joining")]
    PaymentRequired,

    #[error("Insufficient balance: need {need}, have {available}")]
    InsufficientBalance { need: Stake, available: Stake },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TossError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The user-facing rendering of this error, if it is a per-command
    /// rejection rather than a failure that should propagate. Storage and
    /// internal errors return `None` and bubble to the outermost handler.
    pub fn user_message(&self) -> Option<String> {
        match self {
            TossError::TossNotFound(id) => Some(format!("Toss {} does not exist.", id)),
            TossError::InvalidState(msg) => Some(format!("That's not possible right now: {}", msg)),
            TossError::AlreadyJoined(id) => {
                Some(format!("You have already joined toss {}.", id))
            }
            TossError::UnknownOption { id: _, option } => Some(format!(
                "'{}' is not one of the options for this toss.",
                option
            )),
            TossError::NotEnoughParticipants { have, .. } => Some(format!(
                "At least 2 participants are needed to resolve a toss (currently {}).",
                have
            )),
            TossError::NotCreator(_) => {
                Some("Only the creator of this toss can close it.".to_string())
            }
            TossError::PaymentRequired => {
                Some("Your stake payment has to go through before you can join.".to_string())
            }
            TossError::InsufficientBalance { need, available } => Some(format!(
                "Insufficient balance: you need {} but have {}.",
                need, available
            )),
            TossError::Validation(msg) => Some(msg.clone()),
            TossError::Core(TossupError::InvalidAmount(msg)) => {
                Some(format!("Invalid amount: {}", msg))
            }
            TossError::Core(TossupError::InsufficientFunds { need, available }) => Some(format!(
                "Insufficient balance: you need {} but have {}.",
                need, available
            )),
            TossError::Core(_) | TossError::Internal(_) => None,
        }
    }
}
