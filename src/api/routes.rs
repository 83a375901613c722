use actix_web::web;

use super::handlers;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/chain", web::get().to(handlers::get_chain))
            .route("/validate", web::get().to(handlers::validate_chain))
            .route("/activity", web::get().to(handlers::get_activity))
            .route("/accounts", web::get().to(handlers::get_all_accounts))
            .route("/accounts", web::post().to(handlers::create_account))
            .route("/accounts/{kind}/{address}", web::get().to(handlers::get_account))
            .route("/accounts/{kind}/{address}", web::delete().to(handlers::remove_account))
            .route("/transactions", web::post().to(handlers::new_transaction))
            .route("/transactions/pending", web::get().to(handlers::get_pending_transactions))
            .route("/transactions/history", web::get().to(handlers::get_transaction_history))
            .route("/transactions/{id}/verify", web::post().to(handlers::verify_transaction))
            .route("/transactions/{id}", web::get().to(handlers::get_transaction_status))
            .route("/transactions/{id}", web::delete().to(handlers::cancel_transaction))
            .route("/mining", web::get().to(handlers::get_mining_status))
            .route("/mining/start", web::post().to(handlers::start_mining))
            .route("/mining/stop", web::post().to(handlers::stop_mining))
            .route("/miner/current", web::put().to(handlers::switch_miner))
            .route("/params", web::get().to(handlers::get_params))
            .route("/params/difficulty", web::put().to(handlers::set_difficulty))
            .route("/params/throttle", web::put().to(handlers::set_throttle))
            .route("/params/reward", web::put().to(handlers::set_reward))
            .route("/params/fee-rate", web::put().to(handlers::set_fee_rate))
    );
}
