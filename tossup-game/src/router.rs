use crate::error::Result;
use crate::intent::IntentParser;
use crate::manager::TossManager;
use std::sync::Arc;
use tossup_core::{Stake, TossRecord, TossStatus};

/// Where a message came from. Tagged once at ingestion; nothing downstream
/// re-derives it from message shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationKind {
    Direct,
    Group,
}

/// A message handed to the router by the messaging collaborator.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub sender: String,
    pub conversation: ConversationKind,
    pub body: String,
}

impl InboundMessage {
    pub fn direct(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            conversation: ConversationKind::Direct,
            body: body.into(),
        }
    }

    pub fn group(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            conversation: ConversationKind::Group,
            body: body.into(),
        }
    }
}

const HELP_TEXT: &str = "Commands:
  create <amount>        start a toss with the given stake
  join <id> <option>     stake and pick an option
  execute <id>           resolve by random draw
  close <id> <option>    creator picks the winning option
  status <id>            show one toss
  list                   show all open tosses
  balance                show your wallet balance and address
  cancel <id>            cancel an open toss
  help                   this text
Anything else creates a toss from your description.";

/// Commands recognised on the case-insensitive first token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Create { amount: String },
    Join { id: String, option: String },
    Execute { id: String },
    Close { id: String, option: String },
    Status { id: String },
    List,
    Balance,
    Cancel { id: String },
    Help,
    Natural { text: String },
    Malformed { usage: &'static str },
}

pub fn parse_command(body: &str) -> Command {
    let trimmed = body.trim();
    let mut tokens = trimmed.split_whitespace();
    let head = match tokens.next() {
        Some(head) => head.to_ascii_lowercase(),
        None => return Command::Help,
    };
    let rest: Vec<&str> = tokens.collect();

    match head.as_str() {
        "create" => match rest.as_slice() {
            [amount] => Command::Create {
                amount: amount.to_string(),
            },
            _ => Command::Malformed {
                usage: "Usage: create <amount>",
            },
        },
        "join" => match rest.as_slice() {
            [id, option] => Command::Join {
                id: id.to_string(),
                option: option.to_string(),
            },
            _ => Command::Malformed {
                usage: "Usage: join <toss-id> <option>",
            },
        },
        "execute" => match rest.as_slice() {
            [id] => Command::Execute { id: id.to_string() },
            _ => Command::Malformed {
                usage: "Usage: execute <toss-id>",
            },
        },
        "close" => match rest.as_slice() {
            [id, option] => Command::Close {
                id: id.to_string(),
                option: option.to_string(),
            },
            _ => Command::Malformed {
                usage: "Usage: close <toss-id> <winning-option>",
            },
        },
        "status" => match rest.as_slice() {
            [id] => Command::Status { id: id.to_string() },
            _ => Command::Malformed {
                usage: "Usage: status <toss-id>",
            },
        },
        "cancel" => match rest.as_slice() {
            [id] => Command::Cancel { id: id.to_string() },
            _ => Command::Malformed {
                usage: "Usage: cancel <toss-id>",
            },
        },
        "list" => Command::List,
        "balance" => Command::Balance,
        "help" => Command::Help,
        _ => Command::Natural {
            text: trimmed.to_string(),
        },
    }
}

/// Dispatches parsed commands against the manager and renders replies.
///
/// User-kind rejections come back as `Ok(reply)`; storage and internal
/// failures propagate for the outermost handler to turn into a generic
/// error line.
pub struct Router {
    manager: Arc<TossManager>,
    intents: Arc<dyn IntentParser>,
}

impl Router {
    pub fn new(manager: Arc<TossManager>, intents: Arc<dyn IntentParser>) -> Self {
        Self { manager, intents }
    }

    pub async fn handle(&self, message: &InboundMessage) -> Result<String> {
        let reply = match self.dispatch(message).await {
            Ok(reply) => reply,
            Err(err) => match err.user_message() {
                Some(reply) => reply,
                None => return Err(err),
            },
        };

        // Group replies address the sender; direct replies don't need to
        Ok(match message.conversation {
            ConversationKind::Group => format!("@{} {}", message.sender, reply),
            ConversationKind::Direct => reply,
        })
    }

    async fn dispatch(&self, message: &InboundMessage) -> Result<String> {
        let sender = message.sender.as_str();

        match parse_command(&message.body) {
            Command::Create { amount } => {
                let stake: Stake = amount.parse()?;
                let record = self.manager.create(sender, stake, None, None).await?;
                Ok(format!(
                    "Toss {} created with a {} stake. Join with: join {} <yes|no>",
                    record.id, record.stake_amount, record.id
                ))
            }
            Command::Join { id, option } => self.join_flow(sender, &id, &option).await,
            Command::Execute { id } => {
                let record = self.manager.execute(&id).await?;
                Ok(format_resolution(&record))
            }
            Command::Close { id, option } => {
                let record = self.manager.close(&id, sender, &option).await?;
                Ok(format_resolution(&record))
            }
            Command::Status { id } => {
                let record = self.manager.get_toss(&id).await?;
                Ok(format_status(&record))
            }
            Command::List => {
                let active = self.manager.list_active().await?;
                if active.is_empty() {
                    return Ok("No open tosses.".to_string());
                }
                let lines: Vec<String> = active
                    .iter()
                    .map(|r| {
                        format!(
                            "#{} [{}] stake {} - {} ({} joined)",
                            r.id,
                            r.status,
                            r.stake_amount,
                            r.topic.as_deref().unwrap_or("coin toss"),
                            r.participants.len()
                        )
                    })
                    .collect();
                Ok(lines.join("\n"))
            }
            Command::Balance => {
                let balance = self.manager.get_user_balance(sender).await?;
                match self.manager.get_player_wallet_address(sender).await? {
                    Some(address) => Ok(format!("Balance: {} at {}", balance, address)),
                    None => Ok("You don't have a wallet yet. It will be created the first time you join a toss.".to_string()),
                }
            }
            Command::Cancel { id } => {
                let record = self.manager.cancel(&id).await?;
                Ok(format!("Toss {} is cancelled.", record.id))
            }
            Command::Help => Ok(HELP_TEXT.to_string()),
            Command::Natural { text } => {
                let intent = self.intents.parse(&text).await?;
                let record = self
                    .manager
                    .create(
                        sender,
                        intent.stake,
                        Some(intent.topic),
                        Some(intent.options.clone()),
                    )
                    .await?;
                Ok(format!(
                    "Toss {} created: \"{}\" with a {} stake. Join with: join {} <{}>",
                    record.id,
                    record.topic.as_deref().unwrap_or(""),
                    record.stake_amount,
                    record.id,
                    intent.options.join("|")
                ))
            }
            Command::Malformed { usage } => Ok(usage.to_string()),
        }
    }

    /// The two-phase join on behalf of the caller: probe for validity and
    /// options, pay the stake into escrow, then commit the seat.
    async fn join_flow(&self, sender: &str, id: &str, option: &str) -> Result<String> {
        let probed = self.manager.join(id, sender).await?;
        if !probed.is_option_valid(option) {
            return Ok(format!(
                "'{}' is not an option for this toss. Pick one of: {}",
                option,
                probed.effective_options().join(", ")
            ));
        }

        let paid = self
            .manager
            .make_payment(sender, id, probed.stake_amount)
            .await?;
        if !paid {
            return Ok("Your stake payment could not be initiated. Nothing was charged.".to_string());
        }

        let record = self
            .manager
            .add_participant(id, sender, option, true)
            .await?;
        Ok(format!(
            "You're in as P{} on toss {} with '{}' ({} staked).",
            record.participants.len(),
            record.id,
            option,
            record.stake_amount
        ))
    }
}

fn format_status(record: &TossRecord) -> String {
    let mut lines = vec![
        format!("Toss {}", record.id),
        format!("  Status: {}", record.status),
        format!("  Creator: {}", record.creator),
        format!("  Stake: {}", record.stake_amount),
    ];
    if let Some(topic) = &record.topic {
        lines.push(format!("  Topic: {}", topic));
    }
    let options = record.effective_options();
    if options.is_empty() {
        lines.push("  Options: open (yes/no by convention)".to_string());
    } else {
        lines.push(format!("  Options: {}", options.join(", ")));
    }
    if record.participants.is_empty() {
        lines.push("  Participants: none yet".to_string());
    } else {
        for (i, choice) in record.participant_options.iter().enumerate() {
            lines.push(format!(
                "  P{}: {} -> {}",
                i + 1,
                choice.participant,
                choice.option
            ));
        }
    }
    if let Some(result) = &record.result {
        lines.push(format!("  Result: {}", result));
    }
    if let Some(winners) = record.winner_label() {
        lines.push(format!("  Winners: {}", winners));
    }
    lines.join("\n")
}

fn format_resolution(record: &TossRecord) -> String {
    match record.status {
        TossStatus::Cancelled => format!(
            "Toss {} drew '{}' but nobody picked it. The toss is cancelled; stakes stay in escrow.",
            record.id,
            record.result.as_deref().unwrap_or("?")
        ),
        _ => {
            let winners = record.winner_label().unwrap_or_default();
            let prize = record
                .payouts
                .first()
                .map(|p| p.amount)
                .unwrap_or(Stake::ZERO);
            let mut reply = format!(
                "Toss {} resolved: '{}' wins! {} get{} {} each.",
                record.id,
                record.result.as_deref().unwrap_or("?"),
                winners,
                if record.winners.len() == 1 { "s" } else { "" },
                prize
            );
            if record.payment_success == Some(false) {
                reply.push_str(" Some payouts did not go through; they are recorded for follow-up.");
            } else if let Some(link) = &record.transaction_link {
                reply.push_str(&format!(" ({})", link));
            }
            reply
        }
    }
}
