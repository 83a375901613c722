use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use utoipa::ToSchema;
use uuid::Uuid;

use std::collections::HashMap;
use std::time::Duration;

use crate::config::{self, ChainParameters, GenesisConfig, ParameterError};

use super::account::{AccountError, AccountKind, AccountView, Ledger};
use super::activity::{ActivityEntry, ActivityLog};
use super::block::Block;
use super::miner::{self, MinerError, MinerEvent, MiningJob, MiningSession, MiningStats, SolvedBlock};
use super::pool::{self, TransactionPool, Verification};
use super::transaction::{
    FailureReason, HistoryEntry, Transaction, TransactionError, TransactionStatus,
};

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Account error: {0}")]
    AccountError(#[from] AccountError),

    #[error("Mining error: {0}")]
    MinerError(#[from] MinerError),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(#[from] ParameterError),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Miner not found: {0}")]
    UnknownMiner(String),

    #[error("Cannot {0} while a block is being mined")]
    MiningInProgress(&'static str),
}

/// Coarse classification of a rejected operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Bad input; nothing was mutated
    Validation,
    /// Malformed signature or key material
    Crypto,
    /// Refused because the mining candidate holds a lock
    Concurrency,
    /// A block candidate or ledger invariant did not hold
    Integrity,
}

impl BlockchainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BlockchainError::TransactionError(err) => match err {
                TransactionError::CryptoError(_) | TransactionError::SerializationError(_) => {
                    ErrorKind::Crypto
                }
                TransactionError::LockedByMining(_) => ErrorKind::Concurrency,
                _ => ErrorKind::Validation,
            },
            BlockchainError::AccountError(err) => match err {
                AccountError::LockedByMining(_) => ErrorKind::Concurrency,
                AccountError::Overdraft { .. } => ErrorKind::Integrity,
                _ => ErrorKind::Validation,
            },
            BlockchainError::MinerError(MinerError::WorkerGone) => ErrorKind::Concurrency,
            BlockchainError::MinerError(_) => ErrorKind::Validation,
            BlockchainError::InvalidParameter(_) | BlockchainError::UnknownMiner(_) => {
                ErrorKind::Validation
            }
            BlockchainError::InvalidBlock(_) => ErrorKind::Integrity,
            BlockchainError::MiningInProgress(_) => ErrorKind::Concurrency,
        }
    }
}

/// A transaction that was mined but failed commit-time validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RejectedTransaction {
    #[schema(value_type = String)]
    pub id: Uuid,
    pub reason: FailureReason,
}

/// What a commit settled
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CommitReport {
    pub block: Block,
    #[schema(value_type = Vec<String>)]
    pub confirmed: Vec<Uuid>,
    pub rejected: Vec<RejectedTransaction>,
    pub fees: f64,
    pub reward: f64,
    pub miner: String,
}

/// Snapshot of the mining side for display
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MiningStatus {
    pub is_mining: bool,
    pub candidate: Option<Block>,
    pub difficulty: usize,
    pub current_miner: Option<String>,
    pub stats: MiningStats,
}

/// The simulation: ledger, pool and chain behind one single-writer service.
///
/// Every mutation goes through `&mut self`, so two commits can never
/// interleave. The only concurrent actor is the mining worker, which talks
/// back through its session's channel.
#[derive(Debug)]
pub struct Blockchain {
    /// The chain of blocks, never empty
    chain: Vec<Block>,

    /// Wallet and miner balances
    ledger: Ledger,

    /// Pending transactions and their history
    pool: TransactionPool,

    /// Audit trail
    activity: ActivityLog,

    /// Runtime tunables
    params: ChainParameters,

    /// Miner credited with the next block reward
    current_miner: Option<String>,

    /// The in-flight search, if any
    session: Option<MiningSession>,

    /// Telemetry of the current (or last) session
    stats: MiningStats,
}

impl Blockchain {
    /// Creates a new blockchain holding only the genesis block
    pub fn new(params: ChainParameters) -> Result<Self, BlockchainError> {
        params.validate()?;

        Ok(Blockchain {
            chain: vec![Block::genesis()],
            ledger: Ledger::new(),
            pool: TransactionPool::new(),
            activity: ActivityLog::new(),
            params,
            current_miner: None,
            session: None,
            stats: MiningStats::default(),
        })
    }

    /// Creates a blockchain and seeds the genesis accounts
    pub fn from_config(params: ChainParameters, genesis: &GenesisConfig) -> Result<Self, BlockchainError> {
        let mut blockchain = Blockchain::new(params)?;

        for seed in &genesis.wallets {
            blockchain.create_account(AccountKind::Wallet, &seed.name, seed.balance)?;
        }
        for seed in &genesis.miners {
            blockchain.create_account(AccountKind::Miner, &seed.name, seed.balance)?;
        }

        let current = genesis
            .current_miner
            .clone()
            .or_else(|| genesis.miners.first().map(|seed| seed.name.trim().to_string()));
        if let Some(name) = current {
            blockchain.switch_current_miner(&name)?;
        }

        info!(
            "Initialized chain with {} wallets and {} miners",
            genesis.wallets.len(),
            genesis.miners.len()
        );
        Ok(blockchain)
    }

    /// Writes rejected operations to the activity log before handing them back
    fn report<T>(&mut self, result: Result<T, BlockchainError>) -> Result<T, BlockchainError> {
        if let Err(err) = &result {
            self.activity.error(err.to_string());
        }
        result
    }

    /// Parses an account namespace from user input, logging a bad one
    pub fn account_kind(&mut self, kind: &str) -> Result<AccountKind, BlockchainError> {
        let result = kind.parse::<AccountKind>().map_err(BlockchainError::from);
        self.report(result)
    }

    // ----- queries -------------------------------------------------------

    /// Gets the entire blockchain
    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    /// Gets the last block in the chain
    pub fn last_block(&self) -> &Block {
        // genesis is never removed
        &self.chain[self.chain.len() - 1]
    }

    /// Gets all pending transactions
    pub fn pending_transactions(&self) -> &[Transaction] {
        self.pool.pending()
    }

    /// Every transaction state transition, oldest first
    pub fn transaction_history(&self) -> &[HistoryEntry] {
        self.pool.history()
    }

    /// Latest status of a transaction
    pub fn transaction_status(&self, id: &Uuid) -> Option<TransactionStatus> {
        self.pool.status_of(id)
    }

    /// Activity log, newest first
    pub fn activity(&self) -> Vec<ActivityEntry> {
        self.activity.entries()
    }

    /// Up to `limit` activity entries, newest first
    pub fn recent_activity(&self, limit: usize) -> Vec<ActivityEntry> {
        self.activity.recent(limit)
    }

    /// Accounts of one kind, sorted by address
    pub fn accounts(&self, kind: AccountKind) -> Vec<AccountView> {
        self.ledger.list(kind)
    }

    /// One account without its key material
    pub fn account(&self, kind: AccountKind, address: &str) -> Option<AccountView> {
        self.ledger.account(kind, address)
    }

    /// Gets a balance
    #[cfg(test)]
    pub fn balance(&self, kind: AccountKind, address: &str) -> Option<f64> {
        self.ledger.balance(kind, address)
    }

    /// Current tunables
    pub fn params(&self) -> ChainParameters {
        self.params
    }

    /// Miner that will receive the next reward
    pub fn current_miner(&self) -> Option<&str> {
        self.current_miner.as_deref()
    }

    /// Whether a search is running
    pub fn is_mining(&self) -> bool {
        self.session.is_some()
    }

    /// Mining state and telemetry
    pub fn mining_status(&self) -> MiningStatus {
        MiningStatus {
            is_mining: self.is_mining(),
            candidate: self.session.as_ref().map(|session| session.candidate().clone()),
            difficulty: self
                .session
                .as_ref()
                .map(|session| session.difficulty())
                .unwrap_or(self.params.difficulty),
            current_miner: self.current_miner.clone(),
            stats: self.stats.clone(),
        }
    }

    /// Block reward plus the fees of everything pending
    pub fn estimated_reward(&self) -> f64 {
        self.params.block_reward + self.pool.estimated_fees(self.params.fee_rate)
    }

    /// Validates the blockchain
    ///
    /// # Returns
    ///
    /// true if every link, stored hash and proof of work checks out
    pub fn is_valid(&self) -> bool {
        if self.chain.first().map(|block| block.hash.as_str()) != Some(Block::genesis().hash.as_str()) {
            return false;
        }

        for i in 1..self.chain.len() {
            let current_block = &self.chain[i];
            let previous_block = &self.chain[i - 1];

            // Check if the hash is correct
            if current_block.hash != current_block.calculate_hash() {
                return false;
            }

            // Check if the previous hash is correct
            if current_block.previous_hash != previous_block.hash {
                return false;
            }

            if current_block.index != previous_block.index + 1
                || current_block.difficulty < config::MIN_DIFFICULTY
                || !current_block.meets_difficulty(current_block.difficulty)
            {
                return false;
            }
        }

        true
    }

    fn locked_ids(&self) -> Vec<Uuid> {
        self.session
            .as_ref()
            .map(|session| session.locked_ids())
            .unwrap_or_default()
    }

    // ----- accounts ------------------------------------------------------

    /// Creates a wallet or miner with a fresh key pair
    pub fn create_account(
        &mut self,
        kind: AccountKind,
        name: &str,
        initial_balance: f64,
    ) -> Result<AccountView, BlockchainError> {
        let result = self
            .ledger
            .create_account(kind, name, initial_balance)
            .map_err(BlockchainError::from);

        if let Ok(account) = &result {
            self.activity
                .success(format!("{} \"{}\" created successfully!", kind, account.address));
        }
        self.report(result)
    }

    /// Removes an account no pending or in-flight transaction refers to
    pub fn remove_account(&mut self, kind: AccountKind, address: &str) -> Result<AccountView, BlockchainError> {
        let result = self.try_remove_account(kind, address);
        if let Ok(account) = &result {
            self.activity
                .success(format!("{} \"{}\" removed successfully!", kind, account.address));
        }
        self.report(result)
    }

    fn try_remove_account(&mut self, kind: AccountKind, address: &str) -> Result<AccountView, BlockchainError> {
        if let Some(session) = &self.session {
            let locked = match kind {
                AccountKind::Wallet => session
                    .candidate()
                    .transactions
                    .iter()
                    .any(|tx| tx.involves(address)),
                AccountKind::Miner => self.current_miner.as_deref() == Some(address),
            };
            if locked {
                return Err(AccountError::LockedByMining(address.to_string()).into());
            }
        }

        let removed = self.ledger.remove_account(kind, address, &self.pool)?;

        if kind == AccountKind::Miner && self.current_miner.as_deref() == Some(address) {
            warn!("Removed the current miner {}; no miner selected", address);
            self.current_miner = None;
        }

        Ok(removed)
    }

    /// Selects the miner credited with the next block reward
    pub fn switch_current_miner(&mut self, name: &str) -> Result<(), BlockchainError> {
        let result = if self.is_mining() {
            Err(BlockchainError::MiningInProgress("switch miners"))
        } else if !self.ledger.contains(AccountKind::Miner, name) {
            Err(BlockchainError::UnknownMiner(name.to_string()))
        } else {
            self.current_miner = Some(name.to_string());
            self.activity.info(format!("Current miner is now \"{}\"", name));
            Ok(())
        };
        self.report(result)
    }

    // ----- transactions --------------------------------------------------

    /// Creates, signs and queues a transfer; balances move only at commit
    pub fn submit_transaction(&mut self, from: &str, to: &str, amount: f64) -> Result<Transaction, BlockchainError> {
        let result = self
            .pool
            .submit(&self.ledger, from, to, amount, self.params.fee_rate)
            .map_err(BlockchainError::from);

        if result.is_ok() {
            self.activity.success("Transaction created and signed successfully!");
        }
        self.report(result)
    }

    /// Re-checks signature and funds of a pending transaction
    pub fn verify_transaction(&mut self, id: &Uuid) -> Result<Verification, BlockchainError> {
        let result = self
            .pool
            .verify(id, &self.ledger, self.params.fee_rate)
            .map_err(BlockchainError::from);

        match &result {
            Ok(outcome) if outcome.is_verified => {
                self.activity.success("Transaction verified successfully!");
            }
            Ok(outcome) => {
                let reason = outcome
                    .reason
                    .map(|reason| reason.to_string())
                    .unwrap_or_default();
                self.activity
                    .error(format!("Transaction {} failed verification: {}", id, reason));
            }
            Err(_) => {}
        }
        self.report(result)
    }

    /// Drops a pending transaction that is not locked by the mining candidate
    pub fn cancel_transaction(&mut self, id: &Uuid) -> Result<Transaction, BlockchainError> {
        let locked = self.locked_ids();
        let result = self.pool.cancel(id, &locked).map_err(BlockchainError::from);

        if let Ok(transaction) = &result {
            self.activity.success(format!("Transaction {} cancelled", transaction.id));

            if self.is_mining() && self.pool.mining_snapshot(&self.ledger).is_empty() {
                self.stop_mining();
            }
        }
        self.report(result)
    }

    // ----- parameters ----------------------------------------------------

    pub fn set_difficulty(&mut self, difficulty: usize) -> Result<(), BlockchainError> {
        let result = config::check_difficulty(difficulty)
            .map_err(BlockchainError::from)
            .and_then(|()| {
                self.params.difficulty = difficulty;
                self.activity.info(format!("Difficulty set to {}", difficulty));
                self.restart_if_mining()
            });
        self.report(result)
    }

    pub fn set_mining_throttle(&mut self, throttle_ms: u64) -> Result<(), BlockchainError> {
        self.params.mining_throttle_ms = throttle_ms;
        self.activity.info(format!("Mining throttle set to {} ms", throttle_ms));
        let result = self.restart_if_mining();
        self.report(result)
    }

    pub fn set_block_reward(&mut self, block_reward: f64) -> Result<(), BlockchainError> {
        let result = config::check_block_reward(block_reward)
            .map(|()| {
                self.params.block_reward = block_reward;
                self.activity.info(format!("Block reward set to {}", block_reward));
            })
            .map_err(BlockchainError::from);
        self.report(result)
    }

    pub fn set_fee_rate(&mut self, fee_rate: f64) -> Result<(), BlockchainError> {
        let result = config::check_fee_rate(fee_rate)
            .map(|()| {
                self.params.fee_rate = fee_rate;
                self.activity.info(format!("Fee rate set to {}", fee_rate));
            })
            .map_err(BlockchainError::from);
        self.report(result)
    }

    /// A running search is never reconfigured: stop it and start over
    fn restart_if_mining(&mut self) -> Result<(), BlockchainError> {
        if self.is_mining() {
            debug!("Restarting mining with new parameters");
            self.stop_mining();
            self.try_start_mining()?;
        }
        Ok(())
    }

    // ----- mining --------------------------------------------------------

    /// Snapshots the signed pending transactions into a candidate and starts
    /// searching for its nonce. Any running session is stopped first.
    pub fn start_mining(&mut self) -> Result<Block, BlockchainError> {
        let result = self.try_start_mining();
        self.report(result)
    }

    fn try_start_mining(&mut self) -> Result<Block, BlockchainError> {
        let miner = self.current_miner.clone().ok_or(MinerError::NoCurrentMiner)?;
        if !self.ledger.contains(AccountKind::Miner, &miner) {
            return Err(BlockchainError::UnknownMiner(miner));
        }

        let transactions = self.pool.mining_snapshot(&self.ledger);
        if transactions.is_empty() {
            return Err(MinerError::NothingToMine.into());
        }

        if self.is_mining() {
            self.stop_mining();
        }

        let last_block = self.last_block();
        let candidate = Block::candidate(
            last_block.index + 1,
            Utc::now().timestamp_millis(),
            transactions,
            last_block.hash.clone(),
            self.params.difficulty,
        );

        let session = miner::spawn(MiningJob {
            block: candidate.clone(),
            difficulty: self.params.difficulty,
            throttle: Duration::from_millis(self.params.mining_throttle_ms),
        });

        self.stats = MiningStats::starting(session.started_at());
        self.session = Some(session);
        self.activity.info(format!(
            "Started mining block #{} with {} transactions",
            candidate.index,
            candidate.transactions.len()
        ));

        Ok(candidate)
    }

    /// Stops the running search, if any. The handle resolves once the worker
    /// has released its thread.
    pub fn stop_mining(&mut self) -> Option<JoinHandle<()>> {
        let session = self.session.take()?;
        let index = session.candidate().index;
        self.stats = MiningStats::default();
        self.activity.info(format!("Mining of block #{} stopped", index));
        Some(session.stop())
    }

    /// Drains worker messages without blocking; commits a solved block
    pub fn poll_mining(&mut self) -> Result<Option<CommitReport>, BlockchainError> {
        loop {
            let event = match self.session.as_mut() {
                Some(session) => session.try_next_event(),
                None => return Ok(None),
            };

            match event {
                Ok(Some(MinerEvent::Progress(progress))) => self.stats.apply_progress(&progress),
                Ok(Some(MinerEvent::Solved(solved))) => return self.finish_mining(solved).map(Some),
                Ok(None) => return Ok(None),
                Err(err) => {
                    self.session = None;
                    let result = Err(err.into());
                    return self.report(result);
                }
            }
        }
    }

    /// Drives the running session until its block is committed
    pub async fn wait_for_block(&mut self) -> Result<CommitReport, BlockchainError> {
        loop {
            let event = match self.session.as_mut() {
                Some(session) => session.next_event().await,
                None => return Err(MinerError::NotMining.into()),
            };

            match event {
                Some(MinerEvent::Progress(progress)) => self.stats.apply_progress(&progress),
                Some(MinerEvent::Solved(solved)) => return self.finish_mining(solved),
                None => {
                    self.session = None;
                    let result = Err(MinerError::WorkerGone.into());
                    return self.report(result);
                }
            }
        }
    }

    fn finish_mining(&mut self, solved: SolvedBlock) -> Result<CommitReport, BlockchainError> {
        let session = self.session.take().ok_or(MinerError::NotMining)?;

        let mut block = session.candidate().clone();
        block.nonce = solved.nonce;
        block.hash = solved.hash.clone();
        self.stats.apply_solved(&solved);

        info!(
            "Solved block {} with nonce {} after {} hashes",
            solved.index, solved.nonce, solved.hashes_processed
        );

        self.commit_block(block)
    }

    // ----- commit --------------------------------------------------------

    /// Settles a solved block.
    ///
    /// Every transaction is re-validated against the current ledger and
    /// applied in order against projected balances; those that fail are
    /// recorded as rejected instead of failing the whole block. The block
    /// keeps its mined transaction set so its proof-of-work hash stays valid.
    pub fn commit_block(&mut self, candidate: Block) -> Result<CommitReport, BlockchainError> {
        let result = self.try_commit_block(candidate);
        self.report(result)
    }

    fn try_commit_block(&mut self, mut block: Block) -> Result<CommitReport, BlockchainError> {
        let last_block = self.last_block();
        if block.index != last_block.index + 1 || block.previous_hash != last_block.hash {
            return Err(BlockchainError::InvalidBlock(format!(
                "block {} does not extend the chain tip {}",
                block.index, last_block.index
            )));
        }

        if block.calculate_hash() != block.hash {
            return Err(BlockchainError::InvalidBlock(format!(
                "block {} hash does not match its contents",
                block.index
            )));
        }

        if block.difficulty < config::MIN_DIFFICULTY || !block.meets_difficulty(block.difficulty) {
            return Err(BlockchainError::InvalidBlock(format!(
                "block {} does not meet difficulty {}",
                block.index, block.difficulty
            )));
        }

        let miner = self.current_miner.clone().ok_or(MinerError::NoCurrentMiner)?;
        if !self.ledger.contains(AccountKind::Miner, &miner) {
            return Err(BlockchainError::UnknownMiner(miner));
        }

        let fee_rate = self.params.fee_rate;

        // Sequential projection so no account can go negative
        let mut projected: HashMap<String, f64> = HashMap::new();
        let mut confirmed: Vec<&Transaction> = Vec::new();
        let mut rejected: Vec<RejectedTransaction> = Vec::new();

        for tx in &block.transactions {
            let outcome = match pool::authenticate(&self.ledger, tx) {
                Err(reason) => Err(reason),
                Ok(()) => {
                    let available = *projected
                        .entry(tx.from.clone())
                        .or_insert_with(|| self.ledger.balance(AccountKind::Wallet, &tx.from).unwrap_or(0.0));
                    if tx.amount > 0.0 && available >= tx.total_cost(fee_rate) {
                        Ok(())
                    } else {
                        Err(FailureReason::InsufficientFunds)
                    }
                }
            };

            match outcome {
                Ok(()) => {
                    if let Some(balance) = projected.get_mut(&tx.from) {
                        *balance -= tx.total_cost(fee_rate);
                    }
                    let receiver = projected
                        .entry(tx.to.clone())
                        .or_insert_with(|| self.ledger.balance(AccountKind::Wallet, &tx.to).unwrap_or(0.0));
                    *receiver += tx.amount;
                    confirmed.push(tx);
                }
                Err(reason) => rejected.push(RejectedTransaction { id: tx.id, reason }),
            }
        }

        for tx in &confirmed {
            self.ledger.debit(AccountKind::Wallet, &tx.from, tx.total_cost(fee_rate))?;
            self.ledger.credit(AccountKind::Wallet, &tx.to, tx.amount)?;
        }

        let fees: f64 = confirmed.iter().map(|tx| tx.fee(fee_rate)).sum();
        let reward = self.params.block_reward + fees;
        self.ledger.credit(AccountKind::Miner, &miner, reward)?;

        let confirmed: Vec<Uuid> = confirmed.iter().map(|tx| tx.id).collect();
        block.rejected = rejected.iter().map(|r| r.id).collect();

        let all_ids: Vec<Uuid> = block.transactions.iter().map(|tx| tx.id).collect();
        self.pool.remove_settled(&all_ids);

        for tx in &block.transactions {
            let mut snapshot = tx.clone();
            match rejected.iter().find(|r| r.id == tx.id) {
                None => {
                    snapshot.is_verified = true;
                    snapshot.is_valid = true;
                    self.pool.record(&snapshot, TransactionStatus::Mined, None);
                    self.activity.success(format!(
                        "Transaction mined successfully: {} sent {} coins to {}",
                        tx.from, tx.amount, tx.to
                    ));
                }
                Some(rejection) => {
                    snapshot.is_valid = rejection.reason != FailureReason::InsufficientFunds;
                    snapshot.is_verified = false;
                    self.pool
                        .record(&snapshot, TransactionStatus::Failed, Some(rejection.reason));
                    self.activity.error(format!(
                        "Transaction {} failed: {}",
                        tx.id, rejection.reason
                    ));
                }
            }
        }

        self.activity.success(format!(
            "Block #{} mined successfully! {} confirmed, {} rejected, {} paid to {}",
            block.index,
            confirmed.len(),
            rejected.len(),
            reward,
            miner
        ));

        self.chain.push(block.clone());

        // A session mining on the old tip can no longer commit
        if self
            .session
            .as_ref()
            .map(|session| session.candidate().index <= block.index)
            .unwrap_or(false)
        {
            self.stop_mining();
        }

        Ok(CommitReport {
            block,
            confirmed,
            rejected,
            fees,
            reward,
            miner,
        })
    }
}
