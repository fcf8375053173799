pub mod toss_store;
pub mod wallet_store;

pub use toss_store::TossStore;
pub use wallet_store::WalletStore;

use crate::error::Result;
use rusqlite::Connection;
use std::path::Path;
use tokio::sync::Mutex;

pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = Connection::open(db_path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };

        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().await;

        // Tosses table; list-shaped fields are JSON text
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tosses (
                id TEXT PRIMARY KEY,
                creator TEXT NOT NULL,
                stake_amount INTEGER NOT NULL,
                status TEXT NOT NULL,
                participants TEXT NOT NULL,
                participant_options TEXT NOT NULL,
                wallet_address TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                topic TEXT,
                options TEXT,
                result TEXT,
                winners TEXT NOT NULL DEFAULT '[]',
                payment_success INTEGER,
                transaction_link TEXT,
                payouts TEXT NOT NULL DEFAULT '[]'
            )",
            [],
        )?;

        // Custodial wallets, keyed by owner ("<participant>" or "toss:<id>")
        conn.execute(
            "CREATE TABLE IF NOT EXISTS wallets (
                owner_key TEXT PRIMARY KEY,
                address TEXT UNIQUE NOT NULL,
                secret TEXT NOT NULL,
                balance INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        // Transfer ledger
        conn.execute(
            "CREATE TABLE IF NOT EXISTS transfers (
                reference TEXT PRIMARY KEY,
                from_owner TEXT NOT NULL,
                to_address TEXT NOT NULL,
                amount INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        // Monotonic id allocation lives with the data, not in the process
        conn.execute(
            "CREATE TABLE IF NOT EXISTS counters (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO counters (name, value) VALUES ('toss', 0)",
            [],
        )?;

        Ok(())
    }

    /// Allocate the next toss id. Atomic under the connection lock and
    /// durable, so restarts and multiple managers sharing this store can
    /// never hand out the same id twice.
    pub async fn next_toss_id(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let value: i64 = conn.query_row(
            "UPDATE counters SET value = value + 1 WHERE name = 'toss' RETURNING value",
            [],
            |row| row.get(0),
        )?;
        Ok(value as u64)
    }

    pub async fn get_connection(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}
