use crate::error::TossupError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Smallest stake unit: one millionth of the stake currency.
const MILLIONTHS_PER_UNIT: u64 = 1_000_000;

/// Fixed-point stake amount with 6 decimal places.
///
/// Stored as an integer count of millionths so pot arithmetic never touches
/// floating point. Parses decimal strings ("5", "0.25", "1.234567") and
/// displays with trailing zeros trimmed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Stake(u64);

impl Stake {
    pub const ZERO: Stake = Stake(0);

    pub const fn from_millionths(millionths: u64) -> Self {
        Stake(millionths)
    }

    pub const fn from_units(units: u64) -> Self {
        Stake(units * MILLIONTHS_PER_UNIT)
    }

    pub fn to_millionths(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_mul(self, n: u64) -> Option<Stake> {
        self.0.checked_mul(n).map(Stake)
    }

    /// Equal split into `n` shares, discarding any sub-millionth remainder.
    pub fn split_among(self, n: u64) -> Option<Stake> {
        self.0.checked_div(n).map(Stake)
    }
}

impl FromStr for Stake {
    type Err = TossupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches('$');
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(TossupError::invalid_amount(format!("'{}'", s)));
        }
        if frac.len() > 6 {
            return Err(TossupError::invalid_amount(format!(
                "'{}' has more than 6 decimal places",
                s
            )));
        }

        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| TossupError::invalid_amount(format!("'{}'", s)))?
        };
        let frac: u64 = if frac.is_empty() {
            0
        } else {
            let scale = 10u64.pow(6 - frac.len() as u32);
            let digits: u64 = frac
                .parse()
                .map_err(|_| TossupError::invalid_amount(format!("'{}'", s)))?;
            digits * scale
        };

        whole
            .checked_mul(MILLIONTHS_PER_UNIT)
            .and_then(|w| w.checked_add(frac))
            .map(Stake)
            .ok_or_else(|| TossupError::invalid_amount(format!("'{}' is too large", s)))
    }
}

impl fmt::Display for Stake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / MILLIONTHS_PER_UNIT;
        let frac = self.0 % MILLIONTHS_PER_UNIT;
        if frac == 0 {
            write!(f, "{}", whole)
        } else {
            let frac = format!("{:06}", frac);
            write!(f, "{}.{}", whole, frac.trim_end_matches('0'))
        }
    }
}

/// Lifecycle status of a toss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TossStatus {
    Created,
    WaitingForPlayer,
    InProgress,
    Completed,
    Cancelled,
}

impl TossStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TossStatus::Created => "CREATED",
            TossStatus::WaitingForPlayer => "WAITING_FOR_PLAYER",
            TossStatus::InProgress => "IN_PROGRESS",
            TossStatus::Completed => "COMPLETED",
            TossStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(TossStatus::Created),
            "WAITING_FOR_PLAYER" => Some(TossStatus::WaitingForPlayer),
            "IN_PROGRESS" => Some(TossStatus::InProgress),
            "COMPLETED" => Some(TossStatus::Completed),
            "CANCELLED" => Some(TossStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TossStatus::Completed | TossStatus::Cancelled)
    }
}

impl fmt::Display for TossStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One participant's chosen option, in join order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantChoice {
    pub participant: String,
    pub option: String,
}

/// Outcome of a single payout transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayoutOutcome {
    /// Transfer initiated; reference identifies it in the ledger.
    Sent { reference: String },
    /// Transfer timed out and may still complete.
    Pending,
    Failed { reason: String },
}

/// Per-winner payout record persisted on the toss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub participant: String,
    pub address: String,
    pub amount: Stake,
    pub outcome: PayoutOutcome,
}

/// A single wager ("toss"): the record persisted by the toss store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TossRecord {
    pub id: String,
    pub creator: String,
    pub stake_amount: Stake,
    pub status: TossStatus,
    pub participants: Vec<String>,
    pub participant_options: Vec<ParticipantChoice>,
    pub wallet_address: String,
    pub created_at: DateTime<Utc>,
    pub topic: Option<String>,
    pub options: Option<Vec<String>>,
    pub result: Option<String>,
    pub winners: Vec<String>,
    pub payment_success: Option<bool>,
    pub transaction_link: Option<String>,
    pub payouts: Vec<Payout>,
}

impl TossRecord {
    pub fn new(
        id: String,
        creator: String,
        stake_amount: Stake,
        wallet_address: String,
        topic: Option<String>,
        options: Option<Vec<String>>,
    ) -> Self {
        Self {
            id,
            creator,
            stake_amount,
            status: TossStatus::Created,
            participants: Vec::new(),
            participant_options: Vec::new(),
            wallet_address,
            created_at: Utc::now(),
            topic,
            options,
            result: None,
            winners: Vec::new(),
            payment_success: None,
            transaction_link: None,
            payouts: Vec::new(),
        }
    }

    pub fn has_participant(&self, participant: &str) -> bool {
        self.participants.iter().any(|p| p == participant)
    }

    pub fn chosen_option(&self, participant: &str) -> Option<&str> {
        self.participant_options
            .iter()
            .find(|c| c.participant == participant)
            .map(|c| c.option.as_str())
    }

    /// The option set resolution draws from: declared options when the toss
    /// has them, otherwise the distinct options participants actually chose
    /// (first-seen casing wins).
    pub fn effective_options(&self) -> Vec<String> {
        if let Some(options) = &self.options {
            if options.len() >= 2 {
                return options.clone();
            }
        }

        let mut distinct: Vec<String> = Vec::new();
        for choice in &self.participant_options {
            if !distinct
                .iter()
                .any(|o| o.eq_ignore_ascii_case(&choice.option))
            {
                distinct.push(choice.option.clone());
            }
        }
        distinct
    }

    /// Whether `option` is allowed for this toss. Tosses without declared
    /// options accept any choice.
    pub fn is_option_valid(&self, option: &str) -> bool {
        match &self.options {
            Some(options) => options.iter().any(|o| o.eq_ignore_ascii_case(option)),
            None => true,
        }
    }

    /// Winners whose choice matches `option`, case-insensitively, in join order.
    pub fn matching_participants(&self, option: &str) -> Vec<String> {
        self.participant_options
            .iter()
            .filter(|c| c.option.eq_ignore_ascii_case(option))
            .map(|c| c.participant.clone())
            .collect()
    }

    /// Comma-joined winner list for display.
    pub fn winner_label(&self) -> Option<String> {
        if self.winners.is_empty() {
            None
        } else {
            Some(self.winners.join(","))
        }
    }
}
