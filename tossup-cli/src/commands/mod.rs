use comfy_table::{presets::UTF8_FULL, Table};
use std::sync::Arc;
use tossup_core::{LocalWalletService, Stake, TossRecord};
use tossup_game::{
    InboundMessage, KeywordIntentParser, Result, Router, TossError, TossManager,
};

pub async fn create_toss(
    manager: &Arc<TossManager>,
    sender: &str,
    amount: &str,
    topic: Option<String>,
    options: Option<Vec<String>>,
) -> Result<()> {
    let stake: Stake = amount.parse()?;
    let record = manager.create(sender, stake, topic, options).await?;

    println!("Created toss {}", record.id);
    println!("Stake: {}", record.stake_amount);
    if let Some(topic) = &record.topic {
        println!("Topic: {}", topic);
    }
    println!("Escrow address: {}", record.wallet_address);
    println!();
    println!("Share this command with the players (you included):");
    println!("tossup join <sender> {} <option>", record.id);

    Ok(())
}

pub async fn join_toss(
    manager: &Arc<TossManager>,
    sender: &str,
    toss_id: &str,
    option: &str,
) -> Result<()> {
    // Two-phase join: probe first so the stake is known before paying
    let probed = manager.join(toss_id, sender).await?;
    if !probed.is_option_valid(option) {
        println!(
            "'{}' is not an option for toss {}. Options: {}",
            option,
            toss_id,
            probed.effective_options().join(", ")
        );
        return Ok(());
    }

    let paid = manager
        .make_payment(sender, toss_id, probed.stake_amount)
        .await?;
    if !paid {
        println!("Stake payment could not be initiated. Nothing was charged.");
        return Ok(());
    }

    let record = manager.add_participant(toss_id, sender, option, true).await?;
    println!(
        "Joined toss {} as P{} with '{}'",
        record.id,
        record.participants.len(),
        option
    );
    println!("Staked: {}", record.stake_amount);

    Ok(())
}

pub async fn execute_toss(manager: &Arc<TossManager>, toss_id: &str) -> Result<()> {
    let record = manager.execute(toss_id).await?;
    print_resolution(&record);
    Ok(())
}

pub async fn close_toss(
    manager: &Arc<TossManager>,
    sender: &str,
    toss_id: &str,
    option: &str,
) -> Result<()> {
    let record = manager.close(toss_id, sender, option).await?;
    print_resolution(&record);
    Ok(())
}

fn print_resolution(record: &TossRecord) {
    match record.winner_label() {
        Some(winners) => {
            println!("------ TOSS RESOLVED ------");
            println!("Result: {}", record.result.as_deref().unwrap_or("?"));
            println!("Winners: {}", winners);

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["Winner", "Prize", "Outcome"]);
            for payout in &record.payouts {
                table.add_row(vec![
                    payout.participant.clone(),
                    payout.amount.to_string(),
                    format!("{:?}", payout.outcome),
                ]);
            }
            println!("{}", table);

            if record.payment_success == Some(false) {
                println!("Some payouts did not go through; see the outcomes above.");
            } else if let Some(link) = &record.transaction_link {
                println!("Transaction: {}", link);
            }
        }
        None => {
            println!(
                "Nobody picked '{}'. Toss {} is cancelled; stakes stay in escrow.",
                record.result.as_deref().unwrap_or("?"),
                record.id
            );
        }
    }
}

pub async fn show_status(manager: &Arc<TossManager>, toss_id: &str) -> Result<()> {
    let record = manager.get_toss(toss_id).await?;

    println!("Toss {}", record.id);
    println!("Status: {}", record.status);
    println!("Creator: {}", record.creator);
    println!("Stake: {}", record.stake_amount);
    if let Some(topic) = &record.topic {
        println!("Topic: {}", topic);
    }
    println!("Options: {}", record.effective_options().join(", "));
    if let Some(result) = &record.result {
        println!("Result: {}", result);
    }
    if let Some(winners) = record.winner_label() {
        println!("Winners: {}", winners);
    }
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["#", "Participant", "Option"]);
    for (i, choice) in record.participant_options.iter().enumerate() {
        table.add_row(vec![
            format!("P{}", i + 1),
            choice.participant.clone(),
            choice.option.clone(),
        ]);
    }
    println!("{}", table);

    Ok(())
}

pub async fn list_tosses(manager: &Arc<TossManager>) -> Result<()> {
    let active = manager.list_active().await?;
    if active.is_empty() {
        println!("No open tosses.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Id", "Status", "Stake", "Topic", "Participants"]);
    for record in &active {
        table.add_row(vec![
            record.id.clone(),
            record.status.to_string(),
            record.stake_amount.to_string(),
            record.topic.clone().unwrap_or_else(|| "coin toss".into()),
            record.participants.len().to_string(),
        ]);
    }

    println!("Open tosses:");
    println!("{}", table);

    Ok(())
}

pub async fn show_balance(manager: &Arc<TossManager>, sender: &str) -> Result<()> {
    let balance = manager.get_user_balance(sender).await?;
    match manager.get_player_wallet_address(sender).await? {
        Some(address) => {
            println!("Balance for '{}': {}", sender, balance);
            println!("Address: {}", address);
        }
        None => {
            println!("'{}' has no wallet yet.", sender);
            println!("One is created on the first join or fund.");
        }
    }
    Ok(())
}

pub async fn cancel_toss(manager: &Arc<TossManager>, toss_id: &str, yes: bool) -> Result<()> {
    if !yes {
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(format!("Cancel toss {}?", toss_id))
            .default(false)
            .interact()
            .map_err(|e| TossError::internal(format!("prompt failed: {}", e)))?;
        if !confirmed {
            println!("Aborted.");
            return Ok(());
        }
    }

    let record = manager.cancel(toss_id).await?;
    println!("Toss {} is cancelled.", record.id);
    Ok(())
}

pub async fn fund_wallet(
    wallets: &Arc<LocalWalletService>,
    sender: &str,
    amount: &str,
) -> Result<()> {
    let amount: Stake = amount.parse()?;
    let balance = wallets.fund(sender, amount).await.map_err(TossError::from)?;
    println!("Funded '{}'; balance is now {}", sender, balance);
    Ok(())
}

/// One chat turn through the router, the way the messaging collaborator
/// would drive it. Per-command failures never take the process down.
pub async fn chat(manager: &Arc<TossManager>, sender: &str, message: &str) -> Result<()> {
    let router = Router::new(manager.clone(), Arc::new(KeywordIntentParser));
    let inbound = InboundMessage::direct(sender, message);

    match router.handle(&inbound).await {
        Ok(reply) => println!("{}", reply),
        Err(e) => {
            tracing::error!("Command handling failed: {}", e);
            println!("An error occurred while processing your request.");
        }
    }
    Ok(())
}
