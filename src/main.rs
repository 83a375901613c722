use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use log::{error, info};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

mod api;
mod blockchain;
mod config;

use api::handlers::BlockchainData;

/// Drains mining messages on a fixed interval and commits solved blocks
fn spawn_mining_driver(blockchain: BlockchainData, poll_interval: Duration) {
    actix_web::rt::spawn(async move {
        let mut interval = tokio::time::interval(poll_interval);

        loop {
            interval.tick().await;

            let result = blockchain
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .poll_mining();

            match result {
                Ok(Some(report)) => info!(
                    "Committed block {} ({} confirmed, {} rejected)",
                    report.block.index,
                    report.confirmed.len(),
                    report.rejected.len()
                ),
                Ok(None) => {}
                Err(err) => error!("Mining driver: {}", err),
            }
        }
    });
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_chain,
        api::handlers::validate_chain,
        api::handlers::get_activity,
        api::handlers::get_all_accounts,
        api::handlers::get_account,
        api::handlers::create_account,
        api::handlers::remove_account,
        api::handlers::new_transaction,
        api::handlers::get_pending_transactions,
        api::handlers::get_transaction_history,
        api::handlers::get_transaction_status,
        api::handlers::verify_transaction,
        api::handlers::cancel_transaction,
        api::handlers::get_mining_status,
        api::handlers::start_mining,
        api::handlers::stop_mining,
        api::handlers::switch_miner,
        api::handlers::get_params,
        api::handlers::set_difficulty,
        api::handlers::set_throttle,
        api::handlers::set_reward,
        api::handlers::set_fee_rate
    ),
    components(
        schemas(
            blockchain::Block,
            blockchain::Transaction,
            blockchain::HistoryEntry,
            blockchain::ActivityEntry,
            blockchain::AccountView,
            blockchain::AccountKind,
            blockchain::MiningStatus,
            blockchain::ErrorKind,
            blockchain::activity::ActivityStatus,
            blockchain::transaction::TransactionStatus,
            blockchain::transaction::FailureReason,
            blockchain::pool::Verification,
            blockchain::miner::MiningStats,
            blockchain::miner::RecentHash,
            api::schema::ErrorResponse,
            api::schema::ChainResponse,
            api::schema::CreateAccountRequest,
            api::schema::TransactionRequest,
            api::schema::SwitchMinerRequest,
            api::schema::DifficultyRequest,
            api::schema::ThrottleRequest,
            api::schema::RewardRequest,
            api::schema::FeeRateRequest,
            api::schema::MiningStartedResponse,
            api::schema::ParamsResponse,
            api::schema::TransactionStatusResponse,
            api::handlers::AccountsResponse
        )
    ),
    tags(
        (name = "blockchain", description = "Proof-of-work chain simulator endpoints")
    ),
    info(
        title = "PoW Ledger Simulator API",
        version = "1.0.0",
        description = "Single-node proof-of-work blockchain simulator",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = config::from_env()?;

    let blockchain = blockchain::Blockchain::from_config(config.chain, &config.genesis)
        .context("failed to initialize blockchain")?;
    let blockchain: BlockchainData = web::Data::new(Mutex::new(blockchain));

    spawn_mining_driver(
        blockchain.clone(),
        Duration::from_millis(config.server.poll_interval_ms.max(1)),
    );

    let bind = (config.server.host.clone(), config.server.port);
    info!("Starting HTTP server at http://{}:{}", bind.0, bind.1);

    // Start HTTP server
    HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        // Configure OpenAPI documentation
        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(blockchain.clone())
            // API routes
            .configure(api::configure_routes)
            // Swagger UI
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone())
            )
    })
    .bind(bind)
    .context("failed to bind HTTP server")?
    .run()
    .await
    .context("HTTP server error")
}
