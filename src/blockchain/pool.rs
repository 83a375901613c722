use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::account::{AccountKind, Ledger};
use super::transaction::{FailureReason, HistoryEntry, Transaction, TransactionError, TransactionStatus};

/// Result of checking a pending transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    /// The transaction that was checked
    #[schema(value_type = String)]
    pub id: Uuid,

    /// Signature and funds both hold
    pub is_verified: bool,

    /// Funds hold
    pub is_valid: bool,

    /// First failing check, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

/// Checks that both parties exist and the signature belongs to the sender
pub(super) fn authenticate(ledger: &Ledger, transaction: &Transaction) -> Result<(), FailureReason> {
    if !ledger.contains(AccountKind::Wallet, &transaction.to) {
        return Err(FailureReason::UnknownAccount);
    }

    let public_key = ledger
        .public_key(&transaction.from)
        .ok_or(FailureReason::UnknownAccount)?;

    // Malformed or missing signatures count as bad signatures
    match transaction.verify_signature(&public_key) {
        Ok(true) => Ok(()),
        Ok(false) | Err(_) => Err(FailureReason::BadSignature),
    }
}

/// Pending transactions plus the append-only history of their transitions
#[derive(Debug, Clone, Default)]
pub struct TransactionPool {
    pending: Vec<Transaction>,
    history: Vec<HistoryEntry>,
}

impl TransactionPool {
    /// Creates an empty pool
    pub fn new() -> Self {
        TransactionPool::default()
    }

    /// Pending transactions in submission order
    pub fn pending(&self) -> &[Transaction] {
        &self.pending
    }

    /// Every recorded transition, oldest first
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    #[cfg(test)]
    fn get(&self, id: &Uuid) -> Option<&Transaction> {
        self.pending.iter().find(|tx| tx.id == *id)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Latest recorded status of a transaction, pending or not
    pub fn status_of(&self, id: &Uuid) -> Option<TransactionStatus> {
        self.latest_entry(id).map(|entry| entry.status)
    }

    fn latest_entry(&self, id: &Uuid) -> Option<&HistoryEntry> {
        self.history.iter().rev().find(|entry| entry.transaction.id == *id)
    }

    /// Whether any pending transaction sends from or to `address`
    pub fn references(&self, address: &str) -> bool {
        self.pending.iter().any(|tx| tx.involves(address))
    }

    /// Fees the pending transactions would pay at `fee_rate`
    pub fn estimated_fees(&self, fee_rate: f64) -> f64 {
        self.pending.iter().map(|tx| tx.fee(fee_rate)).sum()
    }

    /// Creates, signs and queues a transfer.
    ///
    /// Nothing is mutated when a check fails. Balances are untouched either way.
    pub fn submit(
        &mut self,
        ledger: &Ledger,
        from: &str,
        to: &str,
        amount: f64,
        fee_rate: f64,
    ) -> Result<Transaction, TransactionError> {
        if from == to {
            return Err(TransactionError::SelfTransfer(from.to_string()));
        }

        if !amount.is_finite() || amount <= 0.0 {
            return Err(TransactionError::InvalidAmount(amount));
        }

        let available = ledger
            .balance(AccountKind::Wallet, from)
            .ok_or_else(|| TransactionError::UnknownAccount(from.to_string()))?;

        if !ledger.contains(AccountKind::Wallet, to) {
            return Err(TransactionError::UnknownAccount(to.to_string()));
        }

        let mut transaction = Transaction::new(from, to, amount);
        let required = transaction.total_cost(fee_rate);
        if available < required {
            return Err(TransactionError::InsufficientFunds {
                required,
                available,
            });
        }

        ledger.sign_transaction(&mut transaction)?;

        info!(
            "Queued transaction {}: {} -> {} ({})",
            transaction.id, transaction.from, transaction.to, transaction.amount
        );

        self.pending.push(transaction.clone());
        self.record(&transaction, TransactionStatus::Created, None);
        self.record(&transaction, TransactionStatus::Broadcast, None);

        Ok(transaction)
    }

    /// Re-checks signature and funds of a pending transaction.
    ///
    /// The outcome only changes when the transaction or the sender's balance
    /// changed; repeated calls do not duplicate history entries.
    pub fn verify(
        &mut self,
        id: &Uuid,
        ledger: &Ledger,
        fee_rate: f64,
    ) -> Result<Verification, TransactionError> {
        let position = self
            .pending
            .iter()
            .position(|tx| tx.id == *id)
            .ok_or(TransactionError::NotFound(*id))?;

        let transaction = &self.pending[position];
        let signature = authenticate(ledger, transaction);
        let funds_ok = ledger
            .balance(AccountKind::Wallet, &transaction.from)
            .map(|balance| balance >= transaction.total_cost(fee_rate))
            .unwrap_or(false);

        let reason = match signature {
            Err(reason) => Some(reason),
            Ok(()) if !funds_ok => Some(FailureReason::InsufficientFunds),
            Ok(()) => None,
        };

        let transaction = &mut self.pending[position];
        transaction.is_valid = funds_ok;
        transaction.is_verified = reason.is_none();
        let snapshot = transaction.clone();

        let status = match reason {
            None => TransactionStatus::Verified,
            Some(_) => TransactionStatus::Failed,
        };

        let unchanged = self
            .latest_entry(id)
            .map(|entry| entry.status == status && entry.reason == reason)
            .unwrap_or(false);
        if !unchanged {
            self.record(&snapshot, status, reason);
        }

        debug!("Verified transaction {}: {:?}", id, reason);

        Ok(Verification {
            id: *id,
            is_verified: snapshot.is_verified,
            is_valid: snapshot.is_valid,
            reason,
        })
    }

    /// Drops a pending transaction unless it is locked by the mining candidate
    pub fn cancel(&mut self, id: &Uuid, locked: &[Uuid]) -> Result<Transaction, TransactionError> {
        if locked.contains(id) {
            return Err(TransactionError::LockedByMining(*id));
        }

        let position = self
            .pending
            .iter()
            .position(|tx| tx.id == *id)
            .ok_or(TransactionError::NotFound(*id))?;

        let transaction = self.pending.remove(position);
        self.record(&transaction, TransactionStatus::Cancelled, None);

        info!("Cancelled transaction {}", id);
        Ok(transaction)
    }

    /// Copy of every pending transaction carrying a valid signature
    pub fn mining_snapshot(&self, ledger: &Ledger) -> Vec<Transaction> {
        self.pending
            .iter()
            .filter(|tx| tx.signature.is_some() && authenticate(ledger, tx).is_ok())
            .cloned()
            .collect()
    }

    /// Removes settled (or rejected) transactions after a commit
    pub(super) fn remove_settled(&mut self, ids: &[Uuid]) {
        self.pending.retain(|tx| !ids.contains(&tx.id));
    }

    /// Appends a transition to the history
    pub(super) fn record(
        &mut self,
        transaction: &Transaction,
        status: TransactionStatus,
        reason: Option<FailureReason>,
    ) {
        self.history.push(HistoryEntry {
            transaction: transaction.clone(),
            status,
            reason,
            timestamp: Utc::now().timestamp_millis(),
        });
    }
}
