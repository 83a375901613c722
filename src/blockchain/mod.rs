// Blockchain module
//
// This module contains the simulator core including:
// - Block structure and proof-of-work hashing
// - Wallet and miner ledger
// - Transaction pool and history
// - Background mining worker
// - Activity log
// - The Blockchain service tying them together

pub mod account;
pub mod activity;
pub mod block;
pub mod chain;
pub mod crypto;
pub mod miner;
pub mod pool;
pub mod transaction;

// Re-export main components for easier access
pub use account::{AccountKind, AccountView};
pub use activity::ActivityEntry;
pub use block::Block;
pub use chain::{Blockchain, BlockchainError, CommitReport, ErrorKind, MiningStatus};
pub use transaction::{HistoryEntry, Transaction};
