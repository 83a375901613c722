use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::crypto::KeyPair;
use super::pool::TransactionPool;
use super::transaction::{Transaction, TransactionError};

/// Errors that can occur during account operations
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Account already exists: {0}")]
    DuplicateAddress(String),

    #[error("Account not found: {0}")]
    NotFound(String),

    #[error("Cannot remove {0}: it has pending transactions")]
    HasPendingTransactions(String),

    #[error("Cannot remove {0}: it is part of the block currently being mined")]
    LockedByMining(String),

    #[error("Account name must not be empty")]
    InvalidName,

    #[error("Invalid balance: {0}")]
    InvalidBalance(f64),

    #[error("Debit of {amount} would overdraw {address} (balance {balance})")]
    Overdraft {
        address: String,
        amount: f64,
        balance: f64,
    },

    #[error("Unknown account kind: {0}")]
    UnknownKind(String),
}

/// Namespace an account lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    /// Originates and receives transfers
    Wallet,
    /// Accrues block rewards
    Miner,
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountKind::Wallet => write!(f, "wallet"),
            AccountKind::Miner => write!(f, "miner"),
        }
    }
}

impl FromStr for AccountKind {
    type Err = AccountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wallet" | "wallets" => Ok(AccountKind::Wallet),
            "miner" | "miners" => Ok(AccountKind::Miner),
            other => Err(AccountError::UnknownKind(other.to_string())),
        }
    }
}

/// A named balance plus the key material that controls it
#[derive(Debug, Clone)]
pub struct Account {
    /// The account's name, unique within its namespace
    pub address: String,

    /// The account's balance
    pub balance: f64,

    key_pair: KeyPair,
}

impl Account {
    fn new(address: String, balance: f64) -> Self {
        Account {
            address,
            balance,
            key_pair: KeyPair::generate(),
        }
    }

    fn view(&self, kind: AccountKind) -> AccountView {
        AccountView {
            address: self.address.clone(),
            kind,
            balance: self.balance,
            public_key: self.key_pair.public_key_hex(),
        }
    }
}

/// Key-free, serialisable snapshot of an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AccountView {
    /// The account's name
    pub address: String,

    /// Wallet or miner
    pub kind: AccountKind,

    /// Current settled balance
    pub balance: f64,

    /// Compressed secp256k1 public key, hex
    pub public_key: String,
}

/// Balances and keys for every wallet and miner.
///
/// Balances only move through `debit`/`credit`, which are reserved for the
/// commit protocol.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    wallets: Arc<DashMap<String, Account>>,
    miners: Arc<DashMap<String, Account>>,
}

impl Ledger {
    /// Creates an empty ledger
    pub fn new() -> Self {
        Ledger::default()
    }

    fn accounts(&self, kind: AccountKind) -> &DashMap<String, Account> {
        match kind {
            AccountKind::Wallet => &self.wallets,
            AccountKind::Miner => &self.miners,
        }
    }

    /// Creates an account with a fresh key pair
    ///
    /// # Arguments
    ///
    /// * `kind` - The namespace to create it in
    /// * `name` - The account's address (surrounding whitespace is trimmed)
    /// * `initial_balance` - Any finite value >= 0
    pub fn create_account(
        &self,
        kind: AccountKind,
        name: &str,
        initial_balance: f64,
    ) -> Result<AccountView, AccountError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AccountError::InvalidName);
        }

        if !initial_balance.is_finite() || initial_balance < 0.0 {
            return Err(AccountError::InvalidBalance(initial_balance));
        }

        match self.accounts(kind).entry(name.to_string()) {
            Entry::Occupied(_) => Err(AccountError::DuplicateAddress(name.to_string())),
            Entry::Vacant(slot) => {
                let account = Account::new(name.to_string(), initial_balance);
                let view = account.view(kind);
                slot.insert(account);
                Ok(view)
            }
        }
    }

    /// Removes an account that no pending transaction refers to
    pub fn remove_account(
        &self,
        kind: AccountKind,
        address: &str,
        pool: &TransactionPool,
    ) -> Result<AccountView, AccountError> {
        if !self.contains(kind, address) {
            return Err(AccountError::NotFound(address.to_string()));
        }

        if kind == AccountKind::Wallet && pool.references(address) {
            return Err(AccountError::HasPendingTransactions(address.to_string()));
        }

        self.accounts(kind)
            .remove(address)
            .map(|(_, account)| account.view(kind))
            .ok_or_else(|| AccountError::NotFound(address.to_string()))
    }

    /// Whether an account exists in the namespace
    pub fn contains(&self, kind: AccountKind, address: &str) -> bool {
        self.accounts(kind).contains_key(address)
    }

    /// Gets a balance
    pub fn balance(&self, kind: AccountKind, address: &str) -> Option<f64> {
        self.accounts(kind).get(address).map(|account| account.balance)
    }

    /// Gets a key-free view of an account
    pub fn account(&self, kind: AccountKind, address: &str) -> Option<AccountView> {
        self.accounts(kind).get(address).map(|account| account.view(kind))
    }

    /// All accounts of a kind, sorted by address
    pub fn list(&self, kind: AccountKind) -> Vec<AccountView> {
        let mut accounts: Vec<AccountView> = self
            .accounts(kind)
            .iter()
            .map(|entry| entry.value().view(kind))
            .collect();
        accounts.sort_by(|a, b| a.address.cmp(&b.address));
        accounts
    }

    /// Sum of all balances of a kind
    #[cfg(test)]
    pub fn total_balance(&self, kind: AccountKind) -> f64 {
        self.accounts(kind).iter().map(|entry| entry.balance).sum()
    }

    /// Public key of a wallet
    pub fn public_key(&self, address: &str) -> Option<PublicKey> {
        self.wallets.get(address).map(|account| *account.key_pair.public_key())
    }

    /// Signs a transaction with its sender's private key
    pub(super) fn sign_transaction(&self, transaction: &mut Transaction) -> Result<(), TransactionError> {
        let account = self
            .wallets
            .get(&transaction.from)
            .ok_or_else(|| TransactionError::UnknownAccount(transaction.from.clone()))?;
        transaction.sign(&account.key_pair)
    }

    /// Removes funds. Never lets a balance go below zero.
    pub(super) fn debit(&self, kind: AccountKind, address: &str, amount: f64) -> Result<f64, AccountError> {
        let mut account = self
            .accounts(kind)
            .get_mut(address)
            .ok_or_else(|| AccountError::NotFound(address.to_string()))?;

        if account.balance < amount {
            return Err(AccountError::Overdraft {
                address: address.to_string(),
                amount,
                balance: account.balance,
            });
        }

        account.balance -= amount;
        Ok(account.balance)
    }

    /// Adds funds
    pub(super) fn credit(&self, kind: AccountKind, address: &str, amount: f64) -> Result<f64, AccountError> {
        let mut account = self
            .accounts(kind)
            .get_mut(address)
            .ok_or_else(|| AccountError::NotFound(address.to_string()))?;

        account.balance += amount;
        Ok(account.balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_creation() {
        let ledger = Ledger::new();
        let alice = ledger.create_account(AccountKind::Wallet, "  Alice ", 100.0).unwrap();

        assert_eq!(alice.address, "Alice");
        assert_eq!(alice.kind, AccountKind::Wallet);
        assert_eq!(alice.balance, 100.0);
        assert_eq!(alice.public_key.len(), 66);
        assert_eq!(ledger.balance(AccountKind::Wallet, "Alice"), Some(100.0));
        assert!(ledger.public_key("Alice").is_some());
    }

    #[test]
    fn test_duplicate_address_is_rejected() {
        let ledger = Ledger::new();
        ledger.create_account(AccountKind::Wallet, "Alice", 100.0).unwrap();

        let result = ledger.create_account(AccountKind::Wallet, "Alice", 5.0);
        assert!(matches!(result, Err(AccountError::DuplicateAddress(name)) if name == "Alice"));
        assert_eq!(ledger.balance(AccountKind::Wallet, "Alice"), Some(100.0));
    }

    #[test]
    fn test_wallets_and_miners_are_separate_namespaces() {
        let ledger = Ledger::new();
        ledger.create_account(AccountKind::Wallet, "Satoshi", 1.0).unwrap();
        ledger.create_account(AccountKind::Miner, "Satoshi", 0.0).unwrap();

        assert_eq!(ledger.list(AccountKind::Wallet).len(), 1);
        assert_eq!(ledger.list(AccountKind::Miner).len(), 1);
        assert!(ledger.public_key("Satoshi").is_some());
    }

    #[test]
    fn test_invalid_inputs() {
        let ledger = Ledger::new();

        assert!(matches!(
            ledger.create_account(AccountKind::Wallet, "   ", 1.0),
            Err(AccountError::InvalidName)
        ));
        assert!(matches!(
            ledger.create_account(AccountKind::Wallet, "Alice", -1.0),
            Err(AccountError::InvalidBalance(_))
        ));
        assert!(matches!(
            ledger.create_account(AccountKind::Wallet, "Alice", f64::NAN),
            Err(AccountError::InvalidBalance(_))
        ));
        assert!(ledger.create_account(AccountKind::Wallet, "Zero", 0.0).is_ok());
    }

    #[test]
    fn test_debit_and_credit() {
        let ledger = Ledger::new();
        ledger.create_account(AccountKind::Wallet, "Alice", 100.0).unwrap();

        assert_eq!(ledger.debit(AccountKind::Wallet, "Alice", 40.0).unwrap(), 60.0);
        assert_eq!(ledger.credit(AccountKind::Wallet, "Alice", 5.0).unwrap(), 65.0);

        let result = ledger.debit(AccountKind::Wallet, "Alice", 65.5);
        assert!(matches!(result, Err(AccountError::Overdraft { .. })));
        assert_eq!(ledger.balance(AccountKind::Wallet, "Alice"), Some(65.0));

        assert!(matches!(
            ledger.credit(AccountKind::Miner, "Alice", 1.0),
            Err(AccountError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_account() {
        let ledger = Ledger::new();
        let pool = TransactionPool::new();
        ledger.create_account(AccountKind::Miner, "Miner 1", 0.0).unwrap();

        let removed = ledger.remove_account(AccountKind::Miner, "Miner 1", &pool).unwrap();
        assert_eq!(removed.address, "Miner 1");
        assert!(!ledger.contains(AccountKind::Miner, "Miner 1"));

        assert!(matches!(
            ledger.remove_account(AccountKind::Miner, "Miner 1", &pool),
            Err(AccountError::NotFound(_))
        ));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("wallet".parse::<AccountKind>().unwrap(), AccountKind::Wallet);
        assert_eq!("Miners".parse::<AccountKind>().unwrap(), AccountKind::Miner);
        assert!("vault".parse::<AccountKind>().is_err());
        assert_eq!(AccountKind::Miner.to_string(), "miner");
    }
}
