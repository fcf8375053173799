//! tossup SDK core: durable toss storage and the custodial wallet
//! abstraction the lifecycle manager is built on.
//!
//! The storage layer is a single SQLite file holding toss records, wallet
//! entries, a transfer ledger, and the toss id counter. The wallet side is a
//! trait (`WalletService`) with a store-backed local implementation; swapping
//! in a remote custodial service only means implementing the trait.

pub mod error;
pub mod storage;
pub mod types;
pub mod wallet;

pub use error::{Result, TossupError};
pub use storage::{Storage, TossStore, WalletStore};
pub use types::{ParticipantChoice, Payout, PayoutOutcome, Stake, TossRecord, TossStatus};
pub use wallet::{
    LocalWalletService, TransferReceipt, WalletBalance, WalletHandle, WalletService,
};
