use crate::error::{Result, TossupError};
use crate::storage::wallet_store::WalletRecord;
use crate::storage::{Storage, WalletStore};
use crate::types::Stake;
use crate::wallet::{
    derive_address, generate_secret, TransferReceipt, WalletBalance, WalletHandle, WalletService,
};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// Store-backed custodial wallet service.
///
/// Balances live in the sibling wallet namespace of the toss store and move
/// inside a single SQLite transaction, so a transfer can never half-apply.
pub struct LocalWalletService {
    storage: Arc<Storage>,
}

impl LocalWalletService {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Faucet deposit for demos and tests. Provisions the wallet if needed.
    pub async fn fund(&self, owner_key: &str, amount: Stake) -> Result<Stake> {
        self.get_wallet(owner_key, true).await?;
        let store = WalletStore::new(&self.storage);
        let balance = store.credit(owner_key, amount).await?;
        tracing::info!("Funded wallet '{}' with {}", owner_key, amount);
        Ok(balance)
    }
}

#[async_trait]
impl WalletService for LocalWalletService {
    async fn create_wallet(&self, owner_key: &str) -> Result<WalletHandle> {
        let store = WalletStore::new(&self.storage);
        if store.wallet_exists(owner_key).await? {
            return Err(TossupError::config(format!(
                "Wallet '{}' already exists",
                owner_key
            )));
        }

        let secret = generate_secret();
        let address = derive_address(&secret);
        let record = WalletRecord {
            owner_key: owner_key.to_string(),
            address: address.clone(),
            secret_hex: hex::encode(secret),
            balance: Stake::ZERO,
            created_at: Utc::now(),
        };
        store.save_wallet(&record).await?;

        tracing::info!("Created wallet '{}' at {}", owner_key, address);
        Ok(WalletHandle {
            owner_key: owner_key.to_string(),
            address,
        })
    }

    async fn get_wallet(
        &self,
        owner_key: &str,
        create_if_missing: bool,
    ) -> Result<Option<WalletHandle>> {
        let store = WalletStore::new(&self.storage);
        if let Some(record) = store.load_wallet(owner_key).await? {
            return Ok(Some(WalletHandle {
                owner_key: record.owner_key,
                address: record.address,
            }));
        }

        if create_if_missing {
            return self.create_wallet(owner_key).await.map(Some);
        }
        Ok(None)
    }

    async fn check_balance(&self, owner_key: &str) -> Result<Option<WalletBalance>> {
        let store = WalletStore::new(&self.storage);
        let record = store.load_wallet(owner_key).await?;
        Ok(record.map(|r| WalletBalance {
            address: r.address,
            balance: r.balance,
        }))
    }

    async fn transfer(
        &self,
        from_owner_key: &str,
        to_address: &str,
        amount: Stake,
    ) -> Result<Option<TransferReceipt>> {
        let store = WalletStore::new(&self.storage);
        let reference = Uuid::new_v4().to_string();

        match store
            .transfer_balance(from_owner_key, to_address, amount, &reference)
            .await
        {
            Ok(true) => {
                tracing::info!(
                    "Transferred {} from '{}' to {} ({})",
                    amount,
                    from_owner_key,
                    to_address,
                    reference
                );
                Ok(Some(TransferReceipt {
                    reference,
                    from_owner: from_owner_key.to_string(),
                    to_address: to_address.to_string(),
                    amount,
                }))
            }
            Ok(false) => {
                tracing::warn!(
                    "Transfer from '{}' refused: unknown destination {}",
                    from_owner_key,
                    to_address
                );
                Ok(None)
            }
            Err(err @ (TossupError::InsufficientFunds { .. } | TossupError::WalletNotFound { .. })) => {
                tracing::warn!("Transfer from '{}' refused: {}", from_owner_key, err);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}
