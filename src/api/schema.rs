use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use uuid::Uuid;

use crate::blockchain::transaction::TransactionStatus;
use crate::blockchain::{AccountKind, Block, ErrorKind};

/// Body returned with every rejected request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Human-readable reason
    pub error: String,

    /// Coarse error class
    pub kind: ErrorKind,
}

/// Response for the chain endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChainResponse {
    /// The length of the chain
    pub length: usize,

    /// The blocks in the chain
    pub chain: Vec<Block>,

    /// Whether the chain is valid
    pub is_valid: bool,
}

/// Request for the create account endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct CreateAccountRequest {
    /// Wallet or miner
    pub kind: AccountKind,

    /// Display name, also the address
    #[schema(example = "Carol")]
    pub name: String,

    /// Starting balance
    #[serde(default)]
    pub balance: f64,
}

/// Request for the transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionRequest {
    /// The sending wallet
    #[schema(example = "Alice")]
    pub from: String,

    /// The receiving wallet
    #[schema(example = "Bob")]
    pub to: String,

    /// The amount to transfer
    #[schema(example = 10.0)]
    pub amount: f64,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct SwitchMinerRequest {
    pub name: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct DifficultyRequest {
    /// Leading zero hex digits, 2 to 10
    pub difficulty: usize,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct ThrottleRequest {
    /// Pause after each nonce batch
    pub throttle_ms: u64,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct RewardRequest {
    pub block_reward: f64,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct FeeRateRequest {
    /// Fraction of the amount, 0 to 1
    pub fee_rate: f64,
}

/// Response for the start mining endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MiningStartedResponse {
    pub message: String,

    /// The candidate being searched
    pub candidate: Block,
}

/// Current tunables plus what the next block would pay
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ParamsResponse {
    pub difficulty: usize,
    pub mining_throttle_ms: u64,
    pub block_reward: f64,
    pub fee_rate: f64,
    pub estimated_reward: f64,
    pub current_miner: Option<String>,
}

/// Latest history label of one transaction
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionStatusResponse {
    #[schema(value_type = String)]
    pub id: Uuid,
    pub status: TransactionStatus,
}

/// Query for the activity endpoint
#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    /// Newest entries to return; all when absent
    pub limit: Option<usize>,
}
