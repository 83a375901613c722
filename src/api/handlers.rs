use actix_web::{web, HttpResponse, Responder};
use log::warn;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use std::sync::{Mutex, MutexGuard, PoisonError};

use super::schema::{
    ActivityQuery, ChainResponse, CreateAccountRequest, DifficultyRequest, ErrorResponse,
    FeeRateRequest, MiningStartedResponse, ParamsResponse, RewardRequest, SwitchMinerRequest,
    ThrottleRequest, TransactionRequest, TransactionStatusResponse,
};
use crate::blockchain::{
    AccountKind, AccountView, ActivityEntry, Blockchain, BlockchainError, ErrorKind, HistoryEntry,
    MiningStatus, Transaction,
};
use crate::blockchain::account::AccountError;
use crate::blockchain::pool::Verification;
use crate::blockchain::transaction::TransactionError;

/// Data structure for the blockchain state
pub type BlockchainData = web::Data<Mutex<Blockchain>>;

/// Every handler holds the lock only for one synchronous command
fn lock(blockchain: &BlockchainData) -> MutexGuard<'_, Blockchain> {
    blockchain.lock().unwrap_or_else(PoisonError::into_inner)
}

fn error_response(err: BlockchainError) -> HttpResponse {
    let kind = err.kind();
    let body = ErrorResponse {
        error: err.to_string(),
        kind,
    };

    match kind {
        ErrorKind::Validation | ErrorKind::Crypto => HttpResponse::BadRequest().json(body),
        ErrorKind::Concurrency | ErrorKind::Integrity => HttpResponse::Conflict().json(body),
    }
}

fn not_found(err: BlockchainError) -> HttpResponse {
    HttpResponse::NotFound().json(ErrorResponse {
        error: err.to_string(),
        kind: err.kind(),
    })
}

fn message(text: impl Into<String>) -> serde_json::Value {
    serde_json::json!({ "message": text.into() })
}

/// Get the full blockchain
///
/// Returns the entire blockchain and its validity status
#[utoipa::path(
    get,
    path = "/api/v1/chain",
    responses(
        (status = 200, description = "Blockchain retrieved successfully", body = ChainResponse)
    )
)]
pub async fn get_chain(blockchain: BlockchainData) -> impl Responder {
    let blockchain = lock(&blockchain);
    let chain = blockchain.chain().to_vec();

    let response = ChainResponse {
        length: chain.len(),
        chain,
        is_valid: blockchain.is_valid(),
    };

    HttpResponse::Ok().json(response)
}

/// Get all pending transactions
///
/// Returns all transactions waiting to be included in a block
#[utoipa::path(
    get,
    path = "/api/v1/transactions/pending",
    responses(
        (status = 200, description = "Pending transactions retrieved successfully", body = Vec<Transaction>)
    )
)]
pub async fn get_pending_transactions(blockchain: BlockchainData) -> impl Responder {
    let transactions = lock(&blockchain).pending_transactions().to_vec();
    HttpResponse::Ok().json(transactions)
}

/// Get the transaction history
///
/// Every status transition, oldest first
#[utoipa::path(
    get,
    path = "/api/v1/transactions/history",
    responses(
        (status = 200, description = "History retrieved successfully", body = Vec<HistoryEntry>)
    )
)]
pub async fn get_transaction_history(blockchain: BlockchainData) -> impl Responder {
    let history = lock(&blockchain).transaction_history().to_vec();
    HttpResponse::Ok().json(history)
}

/// Create a new transaction
///
/// Signs the transfer with the sender's key and adds it to the pool.
/// Balances only move when the transaction is mined.
#[utoipa::path(
    post,
    path = "/api/v1/transactions",
    request_body = TransactionRequest,
    responses(
        (status = 201, description = "Transaction created successfully", body = Transaction),
        (status = 400, description = "Invalid transaction data", body = ErrorResponse)
    )
)]
pub async fn new_transaction(
    blockchain: BlockchainData,
    transaction_req: web::Json<TransactionRequest>,
) -> impl Responder {
    let result = lock(&blockchain).submit_transaction(
        &transaction_req.from,
        &transaction_req.to,
        transaction_req.amount,
    );

    match result {
        Ok(transaction) => HttpResponse::Created().json(transaction),
        Err(err) => error_response(err),
    }
}

/// Get the status of a transaction
///
/// Returns the latest history label, whether or not it is still pending
#[utoipa::path(
    get,
    path = "/api/v1/transactions/{id}",
    params(("id" = String, Path, description = "Transaction id")),
    responses(
        (status = 200, description = "Transaction status", body = TransactionStatusResponse),
        (status = 404, description = "Unknown transaction", body = ErrorResponse)
    )
)]
pub async fn get_transaction_status(blockchain: BlockchainData, id: web::Path<Uuid>) -> impl Responder {
    let id = id.into_inner();

    match lock(&blockchain).transaction_status(&id) {
        Some(status) => HttpResponse::Ok().json(TransactionStatusResponse { id, status }),
        None => not_found(BlockchainError::from(TransactionError::NotFound(id))),
    }
}

/// Verify a pending transaction
///
/// Re-checks its signature and the sender's funds
#[utoipa::path(
    post,
    path = "/api/v1/transactions/{id}/verify",
    params(("id" = String, Path, description = "Transaction id")),
    responses(
        (status = 200, description = "Verification outcome", body = Verification),
        (status = 400, description = "Unknown transaction", body = ErrorResponse)
    )
)]
pub async fn verify_transaction(blockchain: BlockchainData, id: web::Path<Uuid>) -> impl Responder {
    match lock(&blockchain).verify_transaction(&id) {
        Ok(verification) => HttpResponse::Ok().json(verification),
        Err(err) => error_response(err),
    }
}

/// Cancel a pending transaction
///
/// Refused while the transaction is part of the block being mined
#[utoipa::path(
    delete,
    path = "/api/v1/transactions/{id}",
    params(("id" = String, Path, description = "Transaction id")),
    responses(
        (status = 200, description = "Transaction cancelled", body = Transaction),
        (status = 400, description = "Unknown transaction", body = ErrorResponse),
        (status = 409, description = "Transaction is being mined", body = ErrorResponse)
    )
)]
pub async fn cancel_transaction(blockchain: BlockchainData, id: web::Path<Uuid>) -> impl Responder {
    match lock(&blockchain).cancel_transaction(&id) {
        Ok(transaction) => HttpResponse::Ok().json(transaction),
        Err(err) => error_response(err),
    }
}

/// Response for the get accounts endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct AccountsResponse {
    pub wallets: Vec<AccountView>,
    pub miners: Vec<AccountView>,
}

/// Get all accounts
///
/// Returns all wallets and miners with their balances
#[utoipa::path(
    get,
    path = "/api/v1/accounts",
    responses(
        (status = 200, description = "Accounts retrieved successfully", body = AccountsResponse)
    )
)]
pub async fn get_all_accounts(blockchain: BlockchainData) -> impl Responder {
    let blockchain = lock(&blockchain);

    HttpResponse::Ok().json(AccountsResponse {
        wallets: blockchain.accounts(AccountKind::Wallet),
        miners: blockchain.accounts(AccountKind::Miner),
    })
}

/// Create a wallet or miner
///
/// Generates a fresh key pair; the private key never leaves the server
#[utoipa::path(
    post,
    path = "/api/v1/accounts",
    request_body = CreateAccountRequest,
    responses(
        (status = 201, description = "Account created successfully", body = AccountView),
        (status = 400, description = "Invalid name or balance", body = ErrorResponse)
    )
)]
pub async fn create_account(
    blockchain: BlockchainData,
    account_req: web::Json<CreateAccountRequest>,
) -> impl Responder {
    let result = lock(&blockchain).create_account(account_req.kind, &account_req.name, account_req.balance);

    match result {
        Ok(account) => HttpResponse::Created().json(account),
        Err(err) => error_response(err),
    }
}

/// Get one account
///
/// Returns the balance and public key of a wallet or miner
#[utoipa::path(
    get,
    path = "/api/v1/accounts/{kind}/{address}",
    params(
        ("kind" = String, Path, description = "wallet or miner"),
        ("address" = String, Path, description = "Account name")
    ),
    responses(
        (status = 200, description = "Account found", body = AccountView),
        (status = 400, description = "Unknown account kind", body = ErrorResponse),
        (status = 404, description = "Account not found", body = ErrorResponse)
    )
)]
pub async fn get_account(
    blockchain: BlockchainData,
    path: web::Path<(String, String)>,
) -> impl Responder {
    let (kind, address) = path.into_inner();
    let mut blockchain = lock(&blockchain);

    let kind = match blockchain.account_kind(&kind) {
        Ok(kind) => kind,
        Err(err) => return error_response(err),
    };

    match blockchain.account(kind, &address) {
        Some(account) => HttpResponse::Ok().json(account),
        None => not_found(BlockchainError::from(AccountError::NotFound(address))),
    }
}

/// Remove a wallet or miner
#[utoipa::path(
    delete,
    path = "/api/v1/accounts/{kind}/{address}",
    params(
        ("kind" = String, Path, description = "wallet or miner"),
        ("address" = String, Path, description = "Account name")
    ),
    responses(
        (status = 200, description = "Account removed", body = AccountView),
        (status = 400, description = "Unknown account or pending transactions", body = ErrorResponse),
        (status = 409, description = "Account is part of the block being mined", body = ErrorResponse)
    )
)]
pub async fn remove_account(
    blockchain: BlockchainData,
    path: web::Path<(String, String)>,
) -> impl Responder {
    let (kind, address) = path.into_inner();
    let mut blockchain = lock(&blockchain);

    let kind = match blockchain.account_kind(&kind) {
        Ok(kind) => kind,
        Err(err) => return error_response(err),
    };

    match blockchain.remove_account(kind, &address) {
        Ok(account) => HttpResponse::Ok().json(account),
        Err(err) => error_response(err),
    }
}

/// Get the mining state
///
/// Returns the candidate block and live telemetry
#[utoipa::path(
    get,
    path = "/api/v1/mining",
    responses(
        (status = 200, description = "Mining status", body = MiningStatus)
    )
)]
pub async fn get_mining_status(blockchain: BlockchainData) -> impl Responder {
    HttpResponse::Ok().json(lock(&blockchain).mining_status())
}

/// Start mining
///
/// Snapshots the signed pending transactions into a candidate block and
/// searches for its nonce in the background
#[utoipa::path(
    post,
    path = "/api/v1/mining/start",
    responses(
        (status = 202, description = "Mining started", body = MiningStartedResponse),
        (status = 400, description = "Nothing to mine or no miner selected", body = ErrorResponse)
    )
)]
pub async fn start_mining(blockchain: BlockchainData) -> impl Responder {
    match lock(&blockchain).start_mining() {
        Ok(candidate) => HttpResponse::Accepted().json(MiningStartedResponse {
            message: format!("Mining block #{}", candidate.index),
            candidate,
        }),
        Err(err) => error_response(err),
    }
}

/// Stop mining
///
/// Responds once the worker has released its thread
#[utoipa::path(
    post,
    path = "/api/v1/mining/stop",
    responses(
        (status = 200, description = "Mining stopped")
    )
)]
pub async fn stop_mining(blockchain: BlockchainData) -> impl Responder {
    let handle = lock(&blockchain).stop_mining();

    match handle {
        Some(handle) => {
            if let Err(err) = handle.await {
                warn!("Mining worker ended abnormally: {}", err);
            }
            HttpResponse::Ok().json(message("Mining stopped"))
        }
        None => HttpResponse::Ok().json(message("Mining was not running")),
    }
}

/// Select the miner that receives the next block reward
#[utoipa::path(
    put,
    path = "/api/v1/miner/current",
    request_body = SwitchMinerRequest,
    responses(
        (status = 200, description = "Current miner switched"),
        (status = 400, description = "Unknown miner", body = ErrorResponse),
        (status = 409, description = "Mining in progress", body = ErrorResponse)
    )
)]
pub async fn switch_miner(
    blockchain: BlockchainData,
    miner_req: web::Json<SwitchMinerRequest>,
) -> impl Responder {
    match lock(&blockchain).switch_current_miner(&miner_req.name) {
        Ok(()) => HttpResponse::Ok().json(message(format!("Current miner is {}", miner_req.name))),
        Err(err) => error_response(err),
    }
}

/// Get the chain parameters
#[utoipa::path(
    get,
    path = "/api/v1/params",
    responses(
        (status = 200, description = "Current parameters", body = ParamsResponse)
    )
)]
pub async fn get_params(blockchain: BlockchainData) -> impl Responder {
    let blockchain = lock(&blockchain);
    let params = blockchain.params();

    HttpResponse::Ok().json(ParamsResponse {
        difficulty: params.difficulty,
        mining_throttle_ms: params.mining_throttle_ms,
        block_reward: params.block_reward,
        fee_rate: params.fee_rate,
        estimated_reward: blockchain.estimated_reward(),
        current_miner: blockchain.current_miner().map(str::to_string),
    })
}

fn params_updated(result: Result<(), BlockchainError>, what: &str) -> HttpResponse {
    match result {
        Ok(()) => HttpResponse::Ok().json(message(format!("{} updated", what))),
        Err(err) => error_response(err),
    }
}

/// Set the mining difficulty
///
/// A running search restarts with the new target
#[utoipa::path(
    put,
    path = "/api/v1/params/difficulty",
    request_body = DifficultyRequest,
    responses(
        (status = 200, description = "Difficulty updated"),
        (status = 400, description = "Out of range", body = ErrorResponse)
    )
)]
pub async fn set_difficulty(
    blockchain: BlockchainData,
    req: web::Json<DifficultyRequest>,
) -> impl Responder {
    params_updated(lock(&blockchain).set_difficulty(req.difficulty), "Difficulty")
}

/// Set the mining throttle
#[utoipa::path(
    put,
    path = "/api/v1/params/throttle",
    request_body = ThrottleRequest,
    responses(
        (status = 200, description = "Throttle updated")
    )
)]
pub async fn set_throttle(
    blockchain: BlockchainData,
    req: web::Json<ThrottleRequest>,
) -> impl Responder {
    params_updated(lock(&blockchain).set_mining_throttle(req.throttle_ms), "Mining throttle")
}

/// Set the block reward
#[utoipa::path(
    put,
    path = "/api/v1/params/reward",
    request_body = RewardRequest,
    responses(
        (status = 200, description = "Block reward updated"),
        (status = 400, description = "Negative reward", body = ErrorResponse)
    )
)]
pub async fn set_reward(blockchain: BlockchainData, req: web::Json<RewardRequest>) -> impl Responder {
    params_updated(lock(&blockchain).set_block_reward(req.block_reward), "Block reward")
}

/// Set the transaction fee rate
#[utoipa::path(
    put,
    path = "/api/v1/params/fee-rate",
    request_body = FeeRateRequest,
    responses(
        (status = 200, description = "Fee rate updated"),
        (status = 400, description = "Out of range", body = ErrorResponse)
    )
)]
pub async fn set_fee_rate(blockchain: BlockchainData, req: web::Json<FeeRateRequest>) -> impl Responder {
    params_updated(lock(&blockchain).set_fee_rate(req.fee_rate), "Fee rate")
}

/// Get the activity log
///
/// Newest entries first
#[utoipa::path(
    get,
    path = "/api/v1/activity",
    params(("limit" = Option<usize>, Query, description = "Maximum number of entries")),
    responses(
        (status = 200, description = "Activity log", body = Vec<ActivityEntry>)
    )
)]
pub async fn get_activity(
    blockchain: BlockchainData,
    query: web::Query<ActivityQuery>,
) -> impl Responder {
    let blockchain = lock(&blockchain);

    let entries = match query.limit {
        Some(limit) => blockchain.recent_activity(limit),
        None => blockchain.activity(),
    };

    HttpResponse::Ok().json(entries)
}

/// Check if the blockchain is valid
///
/// Validates links, hashes and proof of work across the entire chain
#[utoipa::path(
    get,
    path = "/api/v1/validate",
    responses(
        (status = 200, description = "Blockchain validation status", body = bool)
    )
)]
pub async fn validate_chain(blockchain: BlockchainData) -> impl Responder {
    let is_valid = lock(&blockchain).is_valid();
    HttpResponse::Ok().json(is_valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::configure_routes;
    use crate::blockchain::activity::ActivityStatus;
    use crate::blockchain::transaction::TransactionStatus;
    use crate::config::{ChainParameters, GenesisConfig};
    use actix_web::{http::StatusCode, test, App};

    fn data() -> BlockchainData {
        let params = ChainParameters {
            difficulty: 2,
            ..ChainParameters::default()
        };
        let blockchain = Blockchain::from_config(params, &GenesisConfig::default()).unwrap();
        web::Data::new(Mutex::new(blockchain))
    }

    #[actix_web::test]
    async fn test_get_chain() {
        let app = test::init_service(App::new().app_data(data()).configure(configure_routes)).await;

        let req = test::TestRequest::get().uri("/api/v1/chain").to_request();
        let body: ChainResponse = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body.length, 1);
        assert!(body.is_valid);
    }

    #[actix_web::test]
    async fn test_rejected_transaction_maps_to_bad_request() {
        let app = test::init_service(App::new().app_data(data()).configure(configure_routes)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/transactions")
            .set_json(serde_json::json!({ "from": "Alice", "to": "Alice", "amount": 1.0 }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let body: ErrorResponse = test::read_body_json(resp).await;
        assert_eq!(body.kind, ErrorKind::Validation);
    }

    #[actix_web::test]
    async fn test_locked_transaction_maps_to_conflict() {
        let data = data();
        let id = {
            let mut blockchain = lock(&data);
            blockchain.set_difficulty(10).unwrap();
            let tx = blockchain.submit_transaction("Alice", "Bob", 5.0).unwrap();
            blockchain.start_mining().unwrap();
            tx.id
        };
        let app = test::init_service(App::new().app_data(data.clone()).configure(configure_routes)).await;

        let req = test::TestRequest::delete()
            .uri(&format!("/api/v1/transactions/{}", id))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let req = test::TestRequest::post().uri("/api/v1/mining/stop").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!lock(&data).is_mining());
    }

    #[actix_web::test]
    async fn test_get_account() {
        let app = test::init_service(App::new().app_data(data()).configure(configure_routes)).await;

        let req = test::TestRequest::get().uri("/api/v1/accounts/wallet/Alice").to_request();
        let account: AccountView = test::call_and_read_body_json(&app, req).await;
        assert_eq!(account.address, "Alice");
        assert_eq!(account.balance, 100.0);

        let req = test::TestRequest::get().uri("/api/v1/accounts/miner/Alice").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_unknown_account_kind() {
        let data = data();
        let app = test::init_service(App::new().app_data(data.clone()).configure(configure_routes)).await;

        for req in [
            test::TestRequest::delete().uri("/api/v1/accounts/vault/Alice"),
            test::TestRequest::get().uri("/api/v1/accounts/vault/Alice"),
        ] {
            let before = lock(&data).activity().len();

            let resp = test::call_service(&app, req.to_request()).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

            let activity = lock(&data).activity();
            assert_eq!(activity.len(), before + 1);
            assert_eq!(activity[0].status, ActivityStatus::Error);
            assert!(activity[0].message.contains("vault"));
        }

        assert!(lock(&data).account(AccountKind::Wallet, "Alice").is_some());
    }

    #[actix_web::test]
    async fn test_get_transaction_status() {
        let data = data();
        let id = lock(&data).submit_transaction("Alice", "Bob", 5.0).unwrap().id;
        let app = test::init_service(App::new().app_data(data.clone()).configure(configure_routes)).await;

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/transactions/{}", id))
            .to_request();
        let body: TransactionStatusResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body.id, id);
        assert_eq!(body.status, TransactionStatus::Broadcast);

        lock(&data).cancel_transaction(&id).unwrap();
        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/transactions/{}", id))
            .to_request();
        let body: TransactionStatusResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body.status, TransactionStatus::Cancelled);

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/transactions/{}", Uuid::new_v4()))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
