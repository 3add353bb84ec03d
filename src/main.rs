mod config;
mod db;
mod dtos;
mod error;
mod handler;
mod middleware;
mod models;
mod routes;
mod service;
mod utils;

use std::{str::FromStr, sync::Arc, time::Duration};

use axum::http::{header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE}, HeaderValue, Method};
use config::Config;
use db::{db::DBClient, memory::MemoryStore, SupportStore};
use dotenv::dotenv;
use middleware::RateLimiter;
use routes::create_router;
use service::{
    ai_service::{AiClient, AnswerSource},
    background_jobs::{start_heartbeat_job, start_queue_expiry_job},
    chatbot_service::ChatbotService,
    escalation_service::EscalationService,
    gateway::Gateway,
    live_chat_service::LiveChatService,
    queue_service::QueueService,
    storage_service::{FileStorage, LocalFileStorage},
};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, Clone)]
pub struct AppState {
    pub env: Config,
    pub store: Arc<dyn SupportStore>,
    pub queue: Arc<QueueService>,
    pub gateway: Arc<Gateway>,
    pub live_chat: Arc<LiveChatService>,
    pub escalation_service: EscalationService,
    pub chatbot: ChatbotService,
    pub storage: Arc<dyn FileStorage>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn SupportStore>, ai: Arc<dyn AnswerSource>) -> Self {
        let queue = Arc::new(QueueService::new());
        let gateway = Arc::new(Gateway::new());
        let live_chat = Arc::new(LiveChatService::new(
            config.clone(),
            store.clone(),
            queue.clone(),
            gateway.clone(),
        ));

        AppState {
            escalation_service: EscalationService::new(store.clone()),
            chatbot: ChatbotService::new(store.clone(), ai),
            storage: Arc::new(LocalFileStorage::new(&config)),
            rate_limiter: Arc::new(RateLimiter::new(
                config.escalation_rate_limit,
                Duration::from_secs(60),
            )),
            env: config,
            store,
            queue,
            gateway,
            live_chat,
        }
    }
}

#[cfg(test)]
impl AppState {
    pub fn for_tests() -> Self {
        let config = Config::for_tests();
        let ai = AiClient::new(&config).expect("test AI client");
        AppState::new(config, Arc::new(MemoryStore::new()), Arc::new(ai))
    }
}

#[tokio::main]
async fn main() {
    dotenv().ok();

    let config = Config::init();

    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::from_str(&config.log_level).unwrap_or(LevelFilter::DEBUG))
        .init();

    let store: Arc<dyn SupportStore> = match config.database_url.as_deref() {
        Some(database_url) => {
            match PgPoolOptions::new()
                .max_connections(config.db_max_connections)
                .min_connections(config.db_min_connections)
                .connect(database_url)
                .await
            {
                Ok(pool) => {
                    tracing::info!("Connection to the database is successful");
                    Arc::new(DBClient::new(pool))
                }
                Err(err) => {
                    tracing::error!("Failed to connect to the database: {:?}", err);
                    std::process::exit(1);
                }
            }
        }
        None => {
            tracing::warn!("DATABASE_URL is not set, using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let ai = match AiClient::new(&config) {
        Ok(ai) => ai,
        Err(err) => {
            tracing::error!("Failed to build the AI client: {}", err);
            std::process::exit(1);
        }
    };

    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("ignoring invalid origin {}", origin);
                None
            }
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_headers([AUTHORIZATION, ACCEPT, CONTENT_TYPE])
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH]);

    let app_state = Arc::new(AppState::new(config.clone(), store, Arc::new(ai)));

    tokio::spawn(start_heartbeat_job(app_state.clone()));
    tokio::spawn(start_queue_expiry_job(app_state.clone()));

    let app = create_router(app_state).layer(cors);

    tracing::info!("Server is running on http://localhost:{}", config.port);

    let listener = match tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!("Failed to bind port {}: {}", config.port, err);
            std::process::exit(1);
        }
    };

    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", err);
    }
}
