use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::crypto::sha256_hex;
use super::transaction::Transaction;

/// Timestamp of the genesis block: 2021-01-01T00:00:00Z in epoch milliseconds
pub const GENESIS_TIMESTAMP: i64 = 1_609_459_200_000;

/// Payload carried by the genesis block
pub const GENESIS_DATA: &str = "Genesis Block";

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Index of the block in the chain
    pub index: u64,

    /// Creation time in epoch milliseconds
    pub timestamp: i64,

    /// Transactions exactly as they were mined
    pub transactions: Vec<Transaction>,

    /// Optional free-form payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    /// Hash of the previous block
    pub previous_hash: String,

    /// Hash of the current block
    pub hash: String,

    /// Proof of work
    pub nonce: u64,

    /// Leading zero hex digits required when the block was mined.
    /// Not part of the hash preimage.
    #[serde(default)]
    pub difficulty: usize,

    /// Transactions that failed validation at commit and were not settled.
    /// Not part of the hash preimage.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schema(value_type = Vec<String>)]
    pub rejected: Vec<Uuid>,
}

impl Block {
    /// Creates an unmined candidate (`nonce = 0`, empty hash)
    pub fn candidate(
        index: u64,
        timestamp: i64,
        transactions: Vec<Transaction>,
        previous_hash: String,
        difficulty: usize,
    ) -> Self {
        Block {
            index,
            timestamp,
            transactions,
            data: None,
            previous_hash,
            hash: String::new(),
            nonce: 0,
            difficulty,
            rejected: Vec::new(),
        }
    }

    /// The fixed root of every chain
    pub fn genesis() -> Self {
        let mut block = Block {
            index: 0,
            timestamp: GENESIS_TIMESTAMP,
            transactions: Vec::new(),
            data: Some(GENESIS_DATA.to_string()),
            previous_hash: "0".to_string(),
            hash: String::new(),
            nonce: 0,
            difficulty: 0,
            rejected: Vec::new(),
        };
        block.hash = block.calculate_hash();
        block
    }

    /// Everything in the hash preimage except the nonce:
    /// `index ∥ timestamp ∥ json(transactions) ∥ data ∥ previousHash`
    pub fn hash_prefix(&self) -> String {
        // Vec<Transaction> serialisation cannot fail: no maps with non-string keys
        let transactions = serde_json::to_string(&self.transactions).unwrap_or_default();

        format!(
            "{}{}{}{}{}",
            self.index,
            self.timestamp,
            transactions,
            self.data.as_deref().unwrap_or(""),
            self.previous_hash
        )
    }

    /// Calculates the hash of the block
    ///
    /// # Returns
    ///
    /// The SHA-256 of the preimage as a hexadecimal string
    pub fn calculate_hash(&self) -> String {
        hash_with_nonce(&self.hash_prefix(), self.nonce)
    }

    /// Whether the stored hash meets `difficulty` leading zeros
    pub fn meets_difficulty(&self, difficulty: usize) -> bool {
        meets_target(&self.hash, difficulty)
    }

    /// Whether `id` was mined in this block but not settled
    #[cfg(test)]
    pub fn was_rejected(&self, id: &Uuid) -> bool {
        self.rejected.contains(id)
    }
}

/// Hashes a precomputed prefix with a nonce appended
pub fn hash_with_nonce(prefix: &str, nonce: u64) -> String {
    sha256_hex(format!("{}{}", prefix, nonce).as_bytes())
}

/// Whether a hex hash starts with `difficulty` zero characters
pub fn meets_target(hash: &str, difficulty: usize) -> bool {
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}
