//! Toss lifecycle engine: the create/join/resolve state machine for group
//! wagers, the text command router, and the intent-parsing seam.
//!
//! A toss moves CREATED -> WAITING_FOR_PLAYER -> IN_PROGRESS and ends
//! COMPLETED or CANCELLED. Joining is two-phase (probe, then pay and
//! commit), resolution is either a random draw (`execute`) or
//! creator-decided (`close`), and payouts are best-effort with per-winner
//! outcomes recorded on the toss.

pub mod error;
pub mod intent;
pub mod manager;
pub mod router;

pub use error::{Result, TossError};
pub use intent::{IntentParser, KeywordIntentParser, TossIntent, DEFAULT_STAKE, MAX_STAKE};
pub use manager::TossManager;
pub use router::{parse_command, Command, ConversationKind, InboundMessage, Router};
