use crate::error::{Result, TossError};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tossup_core::{
    ParticipantChoice, Payout, PayoutOutcome, Stake, Storage, TossRecord, TossStatus, TossStore,
    TossupError, WalletService,
};

fn escrow_key(id: &str) -> String {
    format!("toss:{}", id)
}

/// Owns the toss state machine: create, two-phase join, resolution, payout,
/// cancellation. Every operation loads fresh state from the store and
/// persists before returning; mutating operations on one toss are
/// serialized through a per-id lock so concurrent joins can't lose updates.
pub struct TossManager {
    storage: Arc<Storage>,
    wallets: Arc<dyn WalletService>,
    locks: Mutex<HashMap<String, Arc<TokioMutex<()>>>>,
}

impl TossManager {
    pub fn new(storage: Arc<Storage>, wallets: Arc<dyn WalletService>) -> Self {
        Self {
            storage,
            wallets,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn toss_lock(&self, id: &str) -> Arc<TokioMutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(TokioMutex::new(())))
            .clone()
    }

    async fn load(&self, id: &str) -> Result<TossRecord> {
        TossStore::new(&self.storage)
            .get_toss(id)
            .await?
            .ok_or_else(|| TossError::TossNotFound(id.to_string()))
    }

    /// Create a new toss with a dedicated escrow wallet. The creator is not
    /// enrolled as a participant; joining (and staking) is explicit for
    /// everyone, creator included.
    pub async fn create(
        &self,
        creator: &str,
        stake: Stake,
        topic: Option<String>,
        options: Option<Vec<String>>,
    ) -> Result<TossRecord> {
        if stake.is_zero() {
            return Err(TossError::Core(TossupError::invalid_amount(
                "stake must be greater than zero",
            )));
        }
        if let Some(options) = &options {
            if options.len() < 2 {
                return Err(TossError::validation(
                    "A toss needs at least 2 options to choose from.",
                ));
            }
        }

        let id = self.storage.next_toss_id().await?.to_string();
        let escrow = self.wallets.create_wallet(&escrow_key(&id)).await?;

        let record = TossRecord::new(
            id.clone(),
            creator.to_string(),
            stake,
            escrow.address,
            topic,
            options,
        );
        TossStore::new(&self.storage).save_toss(&record).await?;

        tracing::info!("Created toss {} by {} with stake {}", id, creator, stake);
        Ok(record)
    }

    fn validate_joinable(record: &TossRecord, participant: &str) -> Result<()> {
        match record.status {
            TossStatus::Created | TossStatus::WaitingForPlayer => {}
            status => {
                return Err(TossError::invalid_state(format!(
                    "toss {} is {} and cannot be joined",
                    record.id, status
                )))
            }
        }
        if record.has_participant(participant) {
            return Err(TossError::AlreadyJoined(record.id.clone()));
        }
        Ok(())
    }

    /// Probe step of the two-phase join: validates the toss can be joined
    /// and returns the record unmodified, so the caller can learn the stake
    /// and options before committing funds.
    pub async fn join(&self, id: &str, participant: &str) -> Result<TossRecord> {
        let record = self.load(id).await?;
        Self::validate_joinable(&record, participant)?;
        Ok(record)
    }

    /// Commit step of the join. `has_paid` is the caller's confirmation that
    /// the stake payment went through; without it nothing is recorded.
    pub async fn add_participant(
        &self,
        id: &str,
        participant: &str,
        chosen_option: &str,
        has_paid: bool,
    ) -> Result<TossRecord> {
        let lock = self.toss_lock(id);
        let _guard = lock.lock().await;

        let mut record = self.load(id).await?;
        Self::validate_joinable(&record, participant)?;
        if !has_paid {
            return Err(TossError::PaymentRequired);
        }
        if !record.is_option_valid(chosen_option) {
            return Err(TossError::UnknownOption {
                id: id.to_string(),
                option: chosen_option.to_string(),
            });
        }

        record.participants.push(participant.to_string());
        record.participant_options.push(ParticipantChoice {
            participant: participant.to_string(),
            option: chosen_option.to_string(),
        });
        record.status = TossStatus::WaitingForPlayer;
        TossStore::new(&self.storage).update_toss(&record).await?;

        tracing::info!(
            "{} joined toss {} with '{}' (P{})",
            participant,
            id,
            chosen_option,
            record.participants.len()
        );
        Ok(record)
    }

    /// Move the stake from the participant's wallet into the toss's escrow.
    /// Returns whether a transfer was initiated; a wallet timeout propagates
    /// so the caller aborts the join rather than recording an unpaid seat.
    pub async fn make_payment(&self, participant: &str, id: &str, amount: Stake) -> Result<bool> {
        let record = self.load(id).await?;

        let balance = self
            .wallets
            .check_balance(participant)
            .await?
            .map(|b| b.balance)
            .unwrap_or(Stake::ZERO);
        if balance < amount {
            return Err(TossError::InsufficientBalance {
                need: amount,
                available: balance,
            });
        }

        match self
            .wallets
            .transfer(participant, &record.wallet_address, amount)
            .await
        {
            Ok(Some(receipt)) => {
                tracing::info!(
                    "{} staked {} on toss {} ({})",
                    participant,
                    amount,
                    id,
                    receipt.reference
                );
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Random resolution: draw the winning option uniformly from the
    /// effective option set.
    pub async fn execute(&self, id: &str) -> Result<TossRecord> {
        self.execute_drawn(id, |options| {
            rand::thread_rng().gen_range(0..options.len())
        })
        .await
    }

    /// Resolution with an injected draw, so tests can force the outcome.
    pub(crate) async fn execute_drawn(
        &self,
        id: &str,
        draw: impl FnOnce(&[String]) -> usize + Send,
    ) -> Result<TossRecord> {
        let lock = self.toss_lock(id);
        let _guard = lock.lock().await;

        let record = self.load(id).await?;
        Self::check_resolvable(&record)?;

        let options = record.effective_options();
        if options.len() < 2 {
            return Err(TossError::invalid_state(format!(
                "toss {} needs at least 2 distinct options to draw from",
                id
            )));
        }

        let record = self.begin_resolution(record).await?;
        let index = draw(&options);
        let winning = options
            .get(index)
            .cloned()
            .ok_or_else(|| TossError::internal("draw index out of range"))?;

        self.settle(record, winning).await
    }

    /// Creator-decided resolution: the creator names the winning option.
    pub async fn close(&self, id: &str, caller: &str, winning_option: &str) -> Result<TossRecord> {
        let lock = self.toss_lock(id);
        let _guard = lock.lock().await;

        let record = self.load(id).await?;
        if record.creator != caller {
            return Err(TossError::NotCreator(id.to_string()));
        }
        if !record.is_option_valid(winning_option) {
            return Err(TossError::UnknownOption {
                id: id.to_string(),
                option: winning_option.to_string(),
            });
        }
        Self::check_resolvable(&record)?;

        // Prefer the declared casing of the chosen option
        let winning = record
            .effective_options()
            .into_iter()
            .find(|o| o.eq_ignore_ascii_case(winning_option))
            .unwrap_or_else(|| winning_option.to_string());

        let record = self.begin_resolution(record).await?;
        self.settle(record, winning).await
    }

    fn check_resolvable(record: &TossRecord) -> Result<()> {
        if record.status != TossStatus::WaitingForPlayer {
            return Err(TossError::invalid_state(format!(
                "toss {} is {} and cannot be resolved",
                record.id, record.status
            )));
        }
        if record.participants.len() < 2 {
            return Err(TossError::NotEnoughParticipants {
                id: record.id.clone(),
                have: record.participants.len(),
            });
        }
        Ok(())
    }

    /// Transition into InProgress, persisted before any result exists so a
    /// crash mid-resolution is observable.
    async fn begin_resolution(&self, mut record: TossRecord) -> Result<TossRecord> {
        record.status = TossStatus::InProgress;
        TossStore::new(&self.storage).update_toss(&record).await?;
        Ok(record)
    }

    /// Determine winners for the winning option and pay out the pot.
    /// Completion is never rolled back on transfer failure; each payout's
    /// outcome is recorded instead.
    async fn settle(&self, mut record: TossRecord, winning: String) -> Result<TossRecord> {
        let store = TossStore::new(&self.storage);
        let winners = record.matching_participants(&winning);
        record.result = Some(winning.clone());

        if winners.is_empty() {
            record.status = TossStatus::Cancelled;
            record.payment_success = Some(false);
            store.update_toss(&record).await?;
            tracing::warn!(
                "Toss {} drew '{}' with no matching participants; cancelled",
                record.id,
                winning
            );
            return Ok(record);
        }

        let pot = record
            .stake_amount
            .checked_mul(record.participants.len() as u64)
            .ok_or_else(|| TossError::internal("pot overflow"))?;
        let prize = pot
            .split_among(winners.len() as u64)
            .ok_or_else(|| TossError::internal("no winners to split among"))?;

        let escrow = escrow_key(&record.id);
        let mut payouts = Vec::with_capacity(winners.len());
        for winner in &winners {
            let address = match self.wallets.get_wallet(winner, true).await? {
                Some(handle) => handle.address,
                None => {
                    payouts.push(Payout {
                        participant: winner.clone(),
                        address: String::new(),
                        amount: prize,
                        outcome: PayoutOutcome::Failed {
                            reason: "no wallet".to_string(),
                        },
                    });
                    continue;
                }
            };

            let outcome = match self.wallets.transfer(&escrow, &address, prize).await {
                Ok(Some(receipt)) => PayoutOutcome::Sent {
                    reference: receipt.reference,
                },
                Ok(None) => PayoutOutcome::Failed {
                    reason: "transfer could not be initiated".to_string(),
                },
                Err(TossupError::Timeout(msg)) => {
                    tracing::warn!(
                        "Payout to {} on toss {} timed out and may still complete: {}",
                        winner,
                        record.id,
                        msg
                    );
                    PayoutOutcome::Pending
                }
                Err(err @ TossupError::Storage(_)) => return Err(err.into()),
                Err(err) => {
                    tracing::warn!("Payout to {} on toss {} failed: {}", winner, record.id, err);
                    PayoutOutcome::Failed {
                        reason: err.to_string(),
                    }
                }
            };
            payouts.push(Payout {
                participant: winner.clone(),
                address,
                amount: prize,
                outcome,
            });
        }

        record.winners = winners;
        record.status = TossStatus::Completed;
        record.payment_success = Some(
            payouts
                .iter()
                .all(|p| matches!(p.outcome, PayoutOutcome::Sent { .. })),
        );
        record.transaction_link = payouts.iter().find_map(|p| match &p.outcome {
            PayoutOutcome::Sent { reference } => Some(format!("transfer:{}", reference)),
            _ => None,
        });
        record.payouts = payouts;
        store.update_toss(&record).await?;

        if record.payment_success == Some(false) {
            tracing::warn!(
                "Toss {} completed with partial payout failure: {:?}",
                record.id,
                record.payouts
            );
        } else {
            tracing::info!(
                "Toss {} completed; '{}' won, {} each to {}",
                record.id,
                winning,
                prize,
                record.winners.join(",")
            );
        }
        Ok(record)
    }

    /// Cancel a toss. Idempotent on an already-cancelled record; a
    /// completed toss cannot be cancelled.
    pub async fn cancel(&self, id: &str) -> Result<TossRecord> {
        let lock = self.toss_lock(id);
        let _guard = lock.lock().await;

        let mut record = self.load(id).await?;
        match record.status {
            TossStatus::Completed => Err(TossError::invalid_state(format!(
                "toss {} is already completed",
                id
            ))),
            TossStatus::Cancelled => Ok(record),
            _ => {
                record.status = TossStatus::Cancelled;
                TossStore::new(&self.storage).update_toss(&record).await?;
                tracing::info!("Cancelled toss {}", id);
                Ok(record)
            }
        }
    }

    pub async fn get_toss(&self, id: &str) -> Result<TossRecord> {
        self.load(id).await
    }

    pub async fn list_active(&self) -> Result<Vec<TossRecord>> {
        Ok(TossStore::new(&self.storage).list_active().await?)
    }

    /// Balance lookup tolerant of a missing wallet.
    pub async fn get_user_balance(&self, participant: &str) -> Result<Stake> {
        let balance = self.wallets.check_balance(participant).await?;
        Ok(balance.map(|b| b.balance).unwrap_or(Stake::ZERO))
    }

    /// Address lookup tolerant of a missing wallet.
    pub async fn get_player_wallet_address(&self, participant: &str) -> Result<Option<String>> {
        let wallet = self.wallets.get_wallet(participant, false).await?;
        Ok(wallet.map(|w| w.address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use tempfile::tempdir;
    use tossup_core::{LocalWalletService, TransferReceipt, WalletBalance, WalletHandle};

    struct TestContext {
        _tmp: tempfile::TempDir,
        storage: Arc<Storage>,
        wallets: Arc<LocalWalletService>,
        manager: TossManager,
    }

    async fn setup() -> TestContext {
        let tmp = tempdir().unwrap();
        let storage = Arc::new(Storage::new(&tmp.path().join("tossup.db")).await.unwrap());
        let wallets = Arc::new(LocalWalletService::new(storage.clone()));
        let manager = TossManager::new(storage.clone(), wallets.clone());
        TestContext {
            _tmp: tmp,
            storage,
            wallets,
            manager,
        }
    }

    async fn join_paid(ctx: &TestContext, id: &str, who: &str, option: &str) {
        let record = ctx.manager.join(id, who).await.unwrap();
        ctx.wallets.fund(who, record.stake_amount).await.unwrap();
        let paid = ctx
            .manager
            .make_payment(who, id, record.stake_amount)
            .await
            .unwrap();
        assert!(paid);
        ctx.manager
            .add_participant(id, who, option, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_allocates_ids_and_escrow_without_enrolling_creator() {
        let ctx = setup().await;

        let first = ctx
            .manager
            .create("alice", Stake::from_units(5), None, None)
            .await
            .unwrap();
        assert_eq!(first.id, "1");
        assert_eq!(first.creator, "alice");
        assert_eq!(first.status, TossStatus::Created);
        assert!(first.participants.is_empty());

        // Escrow wallet exists and is empty
        let escrow = ctx.wallets.check_balance("toss:1").await.unwrap().unwrap();
        assert_eq!(escrow.address, first.wallet_address);
        assert_eq!(escrow.balance, Stake::ZERO);

        let second = ctx
            .manager
            .create("bob", Stake::from_units(1), None, None)
            .await
            .unwrap();
        assert_eq!(second.id, "2");

        // Cancellation does not free the id for reuse
        ctx.manager.cancel("2").await.unwrap();
        let third = ctx
            .manager
            .create("bob", Stake::from_units(1), None, None)
            .await
            .unwrap();
        assert_eq!(third.id, "3");
    }

    #[tokio::test]
    async fn id_allocation_is_shared_across_managers() {
        let ctx = setup().await;
        let second_manager = TossManager::new(ctx.storage.clone(), ctx.wallets.clone());

        let a = ctx
            .manager
            .create("alice", Stake::from_units(1), None, None)
            .await
            .unwrap();
        let b = second_manager
            .create("bob", Stake::from_units(1), None, None)
            .await
            .unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn create_rejects_zero_stake_and_short_option_lists() {
        let ctx = setup().await;

        assert!(ctx
            .manager
            .create("alice", Stake::ZERO, None, None)
            .await
            .is_err());
        assert!(ctx
            .manager
            .create(
                "alice",
                Stake::from_units(1),
                None,
                Some(vec!["yes".to_string()])
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn join_probe_leaves_record_untouched() {
        let ctx = setup().await;
        ctx.manager
            .create("alice", Stake::from_units(5), None, None)
            .await
            .unwrap();

        let probed = ctx.manager.join("1", "bob").await.unwrap();
        assert_eq!(probed.status, TossStatus::Created);

        let stored = ctx.manager.get_toss("1").await.unwrap();
        assert!(stored.participants.is_empty());
        assert_eq!(stored.status, TossStatus::Created);

        assert!(matches!(
            ctx.manager.join("99", "bob").await.unwrap_err(),
            TossError::TossNotFound(_)
        ));
    }

    #[tokio::test]
    async fn duplicate_join_is_rejected() {
        let ctx = setup().await;
        ctx.manager
            .create("alice", Stake::from_units(5), None, None)
            .await
            .unwrap();
        join_paid(&ctx, "1", "alice", "yes").await;

        assert!(matches!(
            ctx.manager.join("1", "alice").await.unwrap_err(),
            TossError::AlreadyJoined(_)
        ));
        assert!(matches!(
            ctx.manager
                .add_participant("1", "alice", "no", true)
                .await
                .unwrap_err(),
            TossError::AlreadyJoined(_)
        ));

        let stored = ctx.manager.get_toss("1").await.unwrap();
        assert_eq!(stored.participants, vec!["alice"]);
        assert_eq!(stored.chosen_option("alice"), Some("yes"));
    }

    #[tokio::test]
    async fn add_participant_requires_confirmed_payment() {
        let ctx = setup().await;
        ctx.manager
            .create("alice", Stake::from_units(5), None, None)
            .await
            .unwrap();

        assert!(matches!(
            ctx.manager
                .add_participant("1", "alice", "yes", false)
                .await
                .unwrap_err(),
            TossError::PaymentRequired
        ));
        assert!(ctx.manager.get_toss("1").await.unwrap().participants.is_empty());
    }

    #[tokio::test]
    async fn unknown_option_is_rejected_without_mutation() {
        let ctx = setup().await;
        ctx.manager
            .create(
                "alice",
                Stake::from_units(5),
                None,
                Some(vec!["yes".to_string(), "no".to_string()]),
            )
            .await
            .unwrap();
        join_paid(&ctx, "1", "alice", "yes").await;
        join_paid(&ctx, "1", "bob", "no").await;

        let err = ctx
            .manager
            .add_participant("1", "carol", "maybe", true)
            .await
            .unwrap_err();
        assert!(matches!(err, TossError::UnknownOption { .. }));

        let stored = ctx.manager.get_toss("1").await.unwrap();
        assert_eq!(stored.participants, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn option_matching_is_case_insensitive() {
        let ctx = setup().await;
        ctx.manager
            .create(
                "alice",
                Stake::from_units(5),
                None,
                Some(vec!["Yes".to_string(), "No".to_string()]),
            )
            .await
            .unwrap();
        join_paid(&ctx, "1", "alice", "YES").await;

        let stored = ctx.manager.get_toss("1").await.unwrap();
        assert_eq!(stored.chosen_option("alice"), Some("YES"));
    }

    #[tokio::test]
    async fn first_join_moves_status_to_waiting() {
        let ctx = setup().await;
        ctx.manager
            .create("alice", Stake::from_units(5), None, None)
            .await
            .unwrap();

        join_paid(&ctx, "1", "alice", "yes").await;
        assert_eq!(
            ctx.manager.get_toss("1").await.unwrap().status,
            TossStatus::WaitingForPlayer
        );

        join_paid(&ctx, "1", "bob", "no").await;
        let stored = ctx.manager.get_toss("1").await.unwrap();
        assert_eq!(stored.status, TossStatus::WaitingForPlayer);
        assert_eq!(stored.participants, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn resolution_needs_waiting_status_and_two_participants() {
        let ctx = setup().await;
        ctx.manager
            .create("alice", Stake::from_units(5), None, None)
            .await
            .unwrap();

        // Nobody joined yet: still CREATED
        assert!(matches!(
            ctx.manager.execute("1").await.unwrap_err(),
            TossError::InvalidState(_)
        ));

        join_paid(&ctx, "1", "alice", "yes").await;
        assert!(matches!(
            ctx.manager.execute("1").await.unwrap_err(),
            TossError::NotEnoughParticipants { have: 1, .. }
        ));
    }

    #[tokio::test]
    async fn execute_pays_the_single_winner_the_whole_pot() {
        let ctx = setup().await;
        ctx.manager
            .create("alice", Stake::from_units(5), None, None)
            .await
            .unwrap();
        join_paid(&ctx, "1", "alice", "yes").await;
        join_paid(&ctx, "1", "bob", "no").await;

        let resolved = ctx
            .manager
            .execute_drawn("1", |options| {
                options.iter().position(|o| o == "yes").unwrap()
            })
            .await
            .unwrap();

        assert_eq!(resolved.status, TossStatus::Completed);
        assert_eq!(resolved.result.as_deref(), Some("yes"));
        assert_eq!(resolved.winners, vec!["alice"]);
        assert_eq!(resolved.winner_label().as_deref(), Some("alice"));
        assert_eq!(resolved.payment_success, Some(true));
        assert!(resolved.transaction_link.is_some());
        assert_eq!(resolved.payouts.len(), 1);
        assert_eq!(resolved.payouts[0].amount, Stake::from_units(10));

        // Stakes were 5 each; alice gets the 10 pot, escrow is drained
        let alice = ctx.manager.get_user_balance("alice").await.unwrap();
        let bob = ctx.manager.get_user_balance("bob").await.unwrap();
        let escrow = ctx.manager.get_user_balance("toss:1").await.unwrap();
        assert_eq!(alice, Stake::from_units(10));
        assert_eq!(bob, Stake::ZERO);
        assert_eq!(escrow, Stake::ZERO);
    }

    #[tokio::test]
    async fn pot_is_split_between_matching_winners() {
        let ctx = setup().await;
        ctx.manager
            .create("alice", Stake::from_units(5), None, None)
            .await
            .unwrap();
        join_paid(&ctx, "1", "alice", "no").await;
        join_paid(&ctx, "1", "bob", "NO").await;
        join_paid(&ctx, "1", "carol", "yes").await;

        let resolved = ctx
            .manager
            .execute_drawn("1", |options| {
                options.iter().position(|o| o.eq_ignore_ascii_case("no")).unwrap()
            })
            .await
            .unwrap();

        // Pot 15, two winners matched case-insensitively, 7.5 each
        assert_eq!(resolved.winners, vec!["alice", "bob"]);
        assert_eq!(resolved.winner_label().as_deref(), Some("alice,bob"));
        let prize = Stake::from_millionths(7_500_000);
        assert!(resolved.payouts.iter().all(|p| p.amount == prize));
        assert_eq!(ctx.manager.get_user_balance("alice").await.unwrap(), prize);
        assert_eq!(ctx.manager.get_user_balance("bob").await.unwrap(), prize);
        assert_eq!(
            ctx.manager.get_user_balance("carol").await.unwrap(),
            Stake::ZERO
        );
    }

    #[tokio::test]
    async fn draw_with_no_matching_participants_cancels() {
        let ctx = setup().await;
        ctx.manager
            .create(
                "alice",
                Stake::from_units(5),
                None,
                Some(vec!["yes".to_string(), "no".to_string()]),
            )
            .await
            .unwrap();
        join_paid(&ctx, "1", "alice", "yes").await;
        join_paid(&ctx, "1", "bob", "yes").await;

        let resolved = ctx
            .manager
            .execute_drawn("1", |options| {
                options.iter().position(|o| o == "no").unwrap()
            })
            .await
            .unwrap();

        assert_eq!(resolved.status, TossStatus::Cancelled);
        assert_eq!(resolved.payment_success, Some(false));
        assert!(resolved.winners.is_empty());

        // Stakes stay in escrow for manual remediation
        assert_eq!(
            ctx.manager.get_user_balance("toss:1").await.unwrap(),
            Stake::from_units(10)
        );
    }

    #[tokio::test]
    async fn close_is_creator_only_and_validates_options() {
        let ctx = setup().await;
        ctx.manager
            .create(
                "alice",
                Stake::from_units(5),
                None,
                Some(vec!["yes".to_string(), "no".to_string()]),
            )
            .await
            .unwrap();
        join_paid(&ctx, "1", "alice", "yes").await;
        join_paid(&ctx, "1", "bob", "no").await;

        assert!(matches!(
            ctx.manager.close("1", "bob", "no").await.unwrap_err(),
            TossError::NotCreator(_)
        ));
        assert!(matches!(
            ctx.manager.close("1", "alice", "maybe").await.unwrap_err(),
            TossError::UnknownOption { .. }
        ));

        let resolved = ctx.manager.close("1", "alice", "NO").await.unwrap();
        assert_eq!(resolved.status, TossStatus::Completed);
        // Declared casing wins over the caller's
        assert_eq!(resolved.result.as_deref(), Some("no"));
        assert_eq!(resolved.winners, vec!["bob"]);
        assert_eq!(
            ctx.manager.get_user_balance("bob").await.unwrap(),
            Stake::from_units(10)
        );
    }

    #[tokio::test]
    async fn cancel_is_idempotent_but_rejected_after_completion() {
        let ctx = setup().await;
        ctx.manager
            .create("alice", Stake::from_units(5), None, None)
            .await
            .unwrap();

        let cancelled = ctx.manager.cancel("1").await.unwrap();
        assert_eq!(cancelled.status, TossStatus::Cancelled);
        // Cancelling again is a no-op, not an error
        assert_eq!(
            ctx.manager.cancel("1").await.unwrap().status,
            TossStatus::Cancelled
        );

        ctx.manager
            .create("alice", Stake::from_units(5), None, None)
            .await
            .unwrap();
        join_paid(&ctx, "2", "alice", "yes").await;
        join_paid(&ctx, "2", "bob", "no").await;
        ctx.manager
            .execute_drawn("2", |options| {
                options.iter().position(|o| o == "yes").unwrap()
            })
            .await
            .unwrap();

        assert!(matches!(
            ctx.manager.cancel("2").await.unwrap_err(),
            TossError::InvalidState(_)
        ));
    }

    #[tokio::test]
    async fn terminal_status_blocks_every_mutation() {
        let ctx = setup().await;
        ctx.manager
            .create("alice", Stake::from_units(5), None, None)
            .await
            .unwrap();
        join_paid(&ctx, "1", "alice", "yes").await;
        join_paid(&ctx, "1", "bob", "no").await;
        ctx.manager
            .execute_drawn("1", |options| {
                options.iter().position(|o| o == "yes").unwrap()
            })
            .await
            .unwrap();

        assert!(ctx
            .manager
            .add_participant("1", "carol", "yes", true)
            .await
            .is_err());
        assert!(ctx.manager.execute("1").await.is_err());
        assert!(ctx.manager.cancel("1").await.is_err());
    }

    #[tokio::test]
    async fn make_payment_checks_balance_before_transferring() {
        let ctx = setup().await;
        ctx.manager
            .create("alice", Stake::from_units(5), None, None)
            .await
            .unwrap();

        // No wallet at all
        let err = ctx
            .manager
            .make_payment("bob", "1", Stake::from_units(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TossError::InsufficientBalance {
                available: Stake::ZERO,
                ..
            }
        ));

        // Wallet with too little
        ctx.wallets.fund("bob", Stake::from_units(2)).await.unwrap();
        assert!(matches!(
            ctx.manager
                .make_payment("bob", "1", Stake::from_units(5))
                .await
                .unwrap_err(),
            TossError::InsufficientBalance { .. }
        ));
    }

    #[tokio::test]
    async fn concurrent_joins_on_one_toss_both_survive() {
        let ctx = setup().await;
        ctx.manager
            .create("alice", Stake::from_units(1), None, None)
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            ctx.manager.add_participant("1", "alice", "yes", true),
            ctx.manager.add_participant("1", "bob", "no", true),
        );
        a.unwrap();
        b.unwrap();

        let stored = ctx.manager.get_toss("1").await.unwrap();
        assert_eq!(stored.participants.len(), 2);
        assert_eq!(stored.participant_options.len(), 2);
    }

    #[tokio::test]
    async fn balance_lookups_tolerate_missing_wallets() {
        let ctx = setup().await;
        assert_eq!(
            ctx.manager.get_user_balance("nobody").await.unwrap(),
            Stake::ZERO
        );
        assert!(ctx
            .manager
            .get_player_wallet_address("nobody")
            .await
            .unwrap()
            .is_none());
    }

    /// Wallet service double that misbehaves for chosen destinations.
    struct FlakyWallets {
        inner: LocalWalletService,
        refuse_to: HashSet<String>,
        timeout_to: HashSet<String>,
    }

    #[async_trait]
    impl WalletService for FlakyWallets {
        async fn create_wallet(&self, owner_key: &str) -> tossup_core::Result<WalletHandle> {
            self.inner.create_wallet(owner_key).await
        }

        async fn get_wallet(
            &self,
            owner_key: &str,
            create_if_missing: bool,
        ) -> tossup_core::Result<Option<WalletHandle>> {
            self.inner.get_wallet(owner_key, create_if_missing).await
        }

        async fn check_balance(
            &self,
            owner_key: &str,
        ) -> tossup_core::Result<Option<WalletBalance>> {
            self.inner.check_balance(owner_key).await
        }

        async fn transfer(
            &self,
            from_owner_key: &str,
            to_address: &str,
            amount: Stake,
        ) -> tossup_core::Result<Option<TransferReceipt>> {
            if self.refuse_to.contains(to_address) {
                return Ok(None);
            }
            if self.timeout_to.contains(to_address) {
                return Err(TossupError::timeout("transfer still in flight"));
            }
            self.inner.transfer(from_owner_key, to_address, amount).await
        }
    }

    async fn setup_flaky(
        refuse: &[&str],
        timeout: &[&str],
    ) -> (tempfile::TempDir, Arc<LocalWalletService>, TossManager) {
        let tmp = tempdir().unwrap();
        let storage = Arc::new(Storage::new(&tmp.path().join("tossup.db")).await.unwrap());
        let wallets = Arc::new(LocalWalletService::new(storage.clone()));
        let flaky = Arc::new(FlakyWallets {
            inner: LocalWalletService::new(storage.clone()),
            refuse_to: refuse.iter().map(|s| s.to_string()).collect(),
            timeout_to: timeout.iter().map(|s| s.to_string()).collect(),
        });
        let manager = TossManager::new(storage, flaky);
        (tmp, wallets, manager)
    }

    #[tokio::test]
    async fn partial_payout_failure_is_recorded_without_rollback() {
        let (_tmp, wallets, manager) = setup_flaky(&[], &[]).await;
        manager
            .create("alice", Stake::from_units(5), None, None)
            .await
            .unwrap();

        for who in ["alice", "bob"] {
            wallets.fund(who, Stake::from_units(5)).await.unwrap();
            manager
                .make_payment(who, "1", Stake::from_units(5))
                .await
                .unwrap();
            manager.add_participant("1", who, "yes", true).await.unwrap();
        }
        let bob_address = manager
            .get_player_wallet_address("bob")
            .await
            .unwrap()
            .unwrap();

        // Re-wire the manager with a service that refuses bob's payout
        let storage = Arc::new(
            Storage::new(&_tmp.path().join("tossup.db")).await.unwrap(),
        );
        let flaky = Arc::new(FlakyWallets {
            inner: LocalWalletService::new(storage.clone()),
            refuse_to: [bob_address.clone()].into_iter().collect(),
            timeout_to: HashSet::new(),
        });
        let manager = TossManager::new(storage, flaky);

        let resolved = manager
            .execute_drawn("1", |options| {
                options.iter().position(|o| o == "yes").unwrap()
            })
            .await
            .unwrap();

        assert_eq!(resolved.status, TossStatus::Completed);
        assert_eq!(resolved.payment_success, Some(false));
        assert_eq!(resolved.payouts.len(), 2);
        assert!(matches!(
            resolved.payouts[0].outcome,
            PayoutOutcome::Sent { .. }
        ));
        assert!(matches!(
            resolved.payouts[1].outcome,
            PayoutOutcome::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn timed_out_payout_is_recorded_as_pending() {
        let (_tmp, wallets, manager) = setup_flaky(&[], &[]).await;
        manager
            .create("alice", Stake::from_units(5), None, None)
            .await
            .unwrap();

        for (who, option) in [("alice", "yes"), ("bob", "no")] {
            wallets.fund(who, Stake::from_units(5)).await.unwrap();
            manager
                .make_payment(who, "1", Stake::from_units(5))
                .await
                .unwrap();
            manager
                .add_participant("1", who, option, true)
                .await
                .unwrap();
        }
        let alice_address = manager
            .get_player_wallet_address("alice")
            .await
            .unwrap()
            .unwrap();

        let storage = Arc::new(
            Storage::new(&_tmp.path().join("tossup.db")).await.unwrap(),
        );
        let flaky = Arc::new(FlakyWallets {
            inner: LocalWalletService::new(storage.clone()),
            refuse_to: HashSet::new(),
            timeout_to: [alice_address].into_iter().collect(),
        });
        let manager = TossManager::new(storage, flaky);

        let resolved = manager
            .execute_drawn("1", |options| {
                options.iter().position(|o| o == "yes").unwrap()
            })
            .await
            .unwrap();

        assert_eq!(resolved.status, TossStatus::Completed);
        assert_eq!(resolved.payment_success, Some(false));
        assert_eq!(resolved.payouts[0].outcome, PayoutOutcome::Pending);
    }

    #[tokio::test]
    async fn stake_payment_timeout_aborts_the_join() {
        let (_tmp, wallets, _manager) = setup_flaky(&[], &[]).await;
        // Build a manager whose escrow address times out
        let storage = Arc::new(
            Storage::new(&_tmp.path().join("tossup.db")).await.unwrap(),
        );
        let plain = TossManager::new(
            storage.clone(),
            Arc::new(LocalWalletService::new(storage.clone())),
        );
        let record = plain
            .create("alice", Stake::from_units(5), None, None)
            .await
            .unwrap();

        let flaky = Arc::new(FlakyWallets {
            inner: LocalWalletService::new(storage.clone()),
            refuse_to: HashSet::new(),
            timeout_to: [record.wallet_address.clone()].into_iter().collect(),
        });
        let manager = TossManager::new(storage, flaky);

        wallets.fund("bob", Stake::from_units(5)).await.unwrap();
        let err = manager
            .make_payment("bob", &record.id, Stake::from_units(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TossError::Core(TossupError::Timeout(_))));
    }
}
