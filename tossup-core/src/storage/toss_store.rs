use crate::error::{Result, TossupError};
use crate::storage::Storage;
use crate::types::{Payout, Stake, TossRecord, TossStatus};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

const TOSS_COLUMNS: &str = "id, creator, stake_amount, status, participants, participant_options, \
     wallet_address, created_at, topic, options, result, winners, payment_success, \
     transaction_link, payouts";

/// Raw row shape; JSON columns are decoded into the domain record afterwards.
struct TossRow {
    id: String,
    creator: String,
    stake_amount: i64,
    status: String,
    participants: String,
    participant_options: String,
    wallet_address: String,
    created_at: i64,
    topic: Option<String>,
    options: Option<String>,
    result: Option<String>,
    winners: String,
    payment_success: Option<bool>,
    transaction_link: Option<String>,
    payouts: String,
}

impl TossRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            creator: row.get(1)?,
            stake_amount: row.get(2)?,
            status: row.get(3)?,
            participants: row.get(4)?,
            participant_options: row.get(5)?,
            wallet_address: row.get(6)?,
            created_at: row.get(7)?,
            topic: row.get(8)?,
            options: row.get(9)?,
            result: row.get(10)?,
            winners: row.get(11)?,
            payment_success: row.get(12)?,
            transaction_link: row.get(13)?,
            payouts: row.get(14)?,
        })
    }

    fn into_record(self) -> Result<TossRecord> {
        let status = TossStatus::parse(&self.status).ok_or_else(|| {
            TossupError::internal(format!("unknown toss status '{}'", self.status))
        })?;
        let options: Option<Vec<String>> = match self.options {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        let payouts: Vec<Payout> = serde_json::from_str(&self.payouts)?;

        Ok(TossRecord {
            id: self.id,
            creator: self.creator,
            stake_amount: Stake::from_millionths(self.stake_amount as u64),
            status,
            participants: serde_json::from_str(&self.participants)?,
            participant_options: serde_json::from_str(&self.participant_options)?,
            wallet_address: self.wallet_address,
            created_at: chrono::DateTime::from_timestamp_millis(self.created_at)
                .unwrap_or_else(Utc::now),
            topic: self.topic,
            options,
            result: self.result,
            winners: serde_json::from_str(&self.winners)?,
            payment_success: self.payment_success,
            transaction_link: self.transaction_link,
            payouts,
        })
    }
}

pub struct TossStore<'a> {
    storage: &'a Storage,
}

impl<'a> TossStore<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    /// Insert or overwrite the record at its id.
    pub async fn save_toss(&self, record: &TossRecord) -> Result<()> {
        let conn = self.storage.get_connection().await;

        conn.execute(
            "INSERT OR REPLACE INTO tosses (id, creator, stake_amount, status, participants, \
             participant_options, wallet_address, created_at, topic, options, result, winners, \
             payment_success, transaction_link, payouts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                record.id,
                record.creator,
                record.stake_amount.to_millionths() as i64,
                record.status.as_str(),
                serde_json::to_string(&record.participants)?,
                serde_json::to_string(&record.participant_options)?,
                record.wallet_address,
                record.created_at.timestamp_millis(),
                record.topic,
                record
                    .options
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                record.result,
                serde_json::to_string(&record.winners)?,
                record.payment_success,
                record.transaction_link,
                serde_json::to_string(&record.payouts)?,
            ],
        )?;

        Ok(())
    }

    /// Alias for `save_toss`; reads better at call sites that mutate.
    pub async fn update_toss(&self, record: &TossRecord) -> Result<()> {
        self.save_toss(record).await
    }

    /// Point lookup. A missing id is `None`, never an error.
    pub async fn get_toss(&self, id: &str) -> Result<Option<TossRecord>> {
        let row = {
            let conn = self.storage.get_connection().await;
            let mut stmt = conn.prepare(&format!("SELECT {} FROM tosses WHERE id = ?1", TOSS_COLUMNS))?;
            stmt.query_row(params![id], TossRow::from_row).optional()?
        };

        row.map(TossRow::into_record).transpose()
    }

    /// Every record not in a terminal status. Iteration order is whatever
    /// the store returns; callers must not rely on it.
    pub async fn list_active(&self) -> Result<Vec<TossRecord>> {
        let rows = {
            let conn = self.storage.get_connection().await;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM tosses WHERE status NOT IN ('COMPLETED', 'CANCELLED')",
                TOSS_COLUMNS
            ))?;
            let iter = stmt.query_map([], TossRow::from_row)?;

            let mut rows = Vec::new();
            for row in iter {
                rows.push(row?);
            }
            rows
        };

        rows.into_iter().map(TossRow::into_record).collect()
    }
}
