use crate::error::{Result, TossupError};
use crate::storage::Storage;
use crate::types::Stake;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Custodial wallet entry: key material plus the current balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletRecord {
    pub owner_key: String,
    pub address: String,
    pub secret_hex: String,
    pub balance: Stake,
    pub created_at: DateTime<Utc>,
}

fn wallet_from_row(row: &Row<'_>) -> rusqlite::Result<WalletRecord> {
    let balance: i64 = row.get(3)?;
    let created_at: i64 = row.get(4)?;
    Ok(WalletRecord {
        owner_key: row.get(0)?,
        address: row.get(1)?,
        secret_hex: row.get(2)?,
        balance: Stake::from_millionths(balance as u64),
        created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_else(Utc::now),
    })
}

pub struct WalletStore<'a> {
    storage: &'a Storage,
}

impl<'a> WalletStore<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    pub async fn save_wallet(&self, record: &WalletRecord) -> Result<()> {
        let conn = self.storage.get_connection().await;

        conn.execute(
            "INSERT OR REPLACE INTO wallets (owner_key, address, secret, balance, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.owner_key,
                record.address,
                record.secret_hex,
                record.balance.to_millionths() as i64,
                record.created_at.timestamp_millis(),
            ],
        )?;

        Ok(())
    }

    pub async fn load_wallet(&self, owner_key: &str) -> Result<Option<WalletRecord>> {
        let conn = self.storage.get_connection().await;

        let mut stmt = conn.prepare(
            "SELECT owner_key, address, secret, balance, created_at
             FROM wallets WHERE owner_key = ?1",
        )?;
        let record = stmt
            .query_row(params![owner_key], wallet_from_row)
            .optional()?;

        Ok(record)
    }

    pub async fn wallet_exists(&self, owner_key: &str) -> Result<bool> {
        let conn = self.storage.get_connection().await;

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM wallets WHERE owner_key = ?1",
            params![owner_key],
            |row| row.get(0),
        )?;

        Ok(count > 0)
    }

    /// Faucet-style deposit, used by demos and tests.
    pub async fn credit(&self, owner_key: &str, amount: Stake) -> Result<Stake> {
        let conn = self.storage.get_connection().await;

        let updated = conn.execute(
            "UPDATE wallets SET balance = balance + ?1 WHERE owner_key = ?2",
            params![amount.to_millionths() as i64, owner_key],
        )?;
        if updated == 0 {
            return Err(TossupError::WalletNotFound {
                owner: owner_key.to_string(),
            });
        }

        let balance: i64 = conn.query_row(
            "SELECT balance FROM wallets WHERE owner_key = ?1",
            params![owner_key],
            |row| row.get(0),
        )?;
        Ok(Stake::from_millionths(balance as u64))
    }

    /// Move `amount` from the owner's wallet to a destination address and
    /// record the ledger row, all in one transaction. Returns `false` when
    /// the destination address is unknown; insufficient balance and a
    /// missing source wallet are errors the caller can match on.
    pub async fn transfer_balance(
        &self,
        from_owner: &str,
        to_address: &str,
        amount: Stake,
        reference: &str,
    ) -> Result<bool> {
        let mut conn = self.storage.get_connection().await;
        let tx = conn.transaction()?;

        let from_balance: Option<i64> = tx
            .query_row(
                "SELECT balance FROM wallets WHERE owner_key = ?1",
                params![from_owner],
                |row| row.get(0),
            )
            .optional()?;
        let from_balance = from_balance.ok_or_else(|| TossupError::WalletNotFound {
            owner: from_owner.to_string(),
        })?;

        let amount_millionths = amount.to_millionths() as i64;
        if from_balance < amount_millionths {
            return Err(TossupError::InsufficientFunds {
                need: amount,
                available: Stake::from_millionths(from_balance as u64),
            });
        }

        let credited = tx.execute(
            "UPDATE wallets SET balance = balance + ?1 WHERE address = ?2",
            params![amount_millionths, to_address],
        )?;
        if credited == 0 {
            return Ok(false);
        }

        tx.execute(
            "UPDATE wallets SET balance = balance - ?1 WHERE owner_key = ?2",
            params![amount_millionths, from_owner],
        )?;
        tx.execute(
            "INSERT INTO transfers (reference, from_owner, to_address, amount, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                reference,
                from_owner,
                to_address,
                amount_millionths,
                Utc::now().timestamp_millis(),
            ],
        )?;

        tx.commit()?;
        Ok(true)
    }
}
