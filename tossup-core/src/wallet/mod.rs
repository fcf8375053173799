pub mod local;

pub use local::LocalWalletService;

use crate::error::Result;
use crate::types::Stake;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Handle to a provisioned wallet. Never carries key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletHandle {
    pub owner_key: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct WalletBalance {
    pub address: String,
    pub balance: Stake,
}

/// An initiated transfer. Initiation is not on-chain confirmation; the
/// service decides how much waiting `transfer` itself does.
#[derive(Debug, Clone)]
pub struct TransferReceipt {
    pub reference: String,
    pub from_owner: String,
    pub to_address: String,
    pub amount: Stake,
}

/// Custodial wallet operations the lifecycle manager depends on.
///
/// `transfer` returning `Ok(None)` means the transfer could not even be
/// initiated (unknown destination, for example). The timeout error variant
/// means the transfer may still complete; callers decide what that implies.
#[async_trait]
pub trait WalletService: Send + Sync {
    async fn create_wallet(&self, owner_key: &str) -> Result<WalletHandle>;

    async fn get_wallet(
        &self,
        owner_key: &str,
        create_if_missing: bool,
    ) -> Result<Option<WalletHandle>>;

    async fn check_balance(&self, owner_key: &str) -> Result<Option<WalletBalance>>;

    async fn transfer(
        &self,
        from_owner_key: &str,
        to_address: &str,
        amount: Stake,
    ) -> Result<Option<TransferReceipt>>;
}

pub fn generate_secret() -> [u8; 32] {
    let mut secret = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut secret);
    secret
}

/// Derive a stable address from wallet key material.
pub fn derive_address(secret: &[u8]) -> String {
    let digest = Sha256::digest(secret);
    format!("0x{}", &hex::encode(digest)[..40])
}
