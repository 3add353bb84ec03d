// config.rs
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub port: u16,
    pub log_level: String,
    pub db_max_connections: u32,
    pub db_min_connections: u32,
    pub allowed_origins: Vec<String>,
    // Chatbot answer service
    pub ai_service_url: String,
    pub ai_timeout_secs: u64,
    // File storage
    pub upload_dir: String,
    pub storage_base_url: String,
    pub max_upload_mb: usize,
    // Realtime
    pub heartbeat_timeout_secs: u64,
    pub heartbeat_sweep_secs: u64,
    pub agent_reconnect_grace_secs: u64,
    pub typing_idle_secs: u64,
    pub dedup_window_ms: u64,
    pub max_queue_wait_secs: Option<u64>,
    pub escalation_rate_limit: usize,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn init() -> Config {
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".to_string())
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect();

        let max_queue_wait_secs = std::env::var("MAX_QUEUE_WAIT_SECS")
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0);

        Config {
            database_url,
            port: env_or("PORT", 8000),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "debug".to_string()),
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 20),
            db_min_connections: env_or("DB_MIN_CONNECTIONS", 5),
            allowed_origins,
            ai_service_url: std::env::var("AI_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:8001".to_string()),
            ai_timeout_secs: env_or("AI_TIMEOUT_SECS", 30),
            upload_dir: std::env::var("UPLOAD_DIR").unwrap_or_else(|_| "./uploads".to_string()),
            storage_base_url: std::env::var("STORAGE_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8000/uploads".to_string()),
            max_upload_mb: env_or("MAX_UPLOAD_MB", 10),
            heartbeat_timeout_secs: env_or("HEARTBEAT_TIMEOUT_SECS", 30),
            heartbeat_sweep_secs: env_or("HEARTBEAT_SWEEP_SECS", 10),
            agent_reconnect_grace_secs: env_or("AGENT_RECONNECT_GRACE_SECS", 5),
            typing_idle_secs: env_or("TYPING_IDLE_SECS", 6),
            dedup_window_ms: env_or("DEDUP_WINDOW_MS", 1000),
            max_queue_wait_secs,
            escalation_rate_limit: env_or("ESCALATION_RATE_LIMIT", 10),
        }
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn agent_reconnect_grace(&self) -> Duration {
        Duration::from_secs(self.agent_reconnect_grace_secs)
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_secs(self.typing_idle_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

#[cfg(test)]
impl Config {
    /// Settings used by unit tests: in-memory store, no grace period.
    pub fn for_tests() -> Config {
        Config {
            database_url: None,
            port: 0,
            log_level: "debug".to_string(),
            db_max_connections: 1,
            db_min_connections: 1,
            allowed_origins: vec![],
            ai_service_url: "http://127.0.0.1:9".to_string(),
            ai_timeout_secs: 1,
            upload_dir: std::env::temp_dir()
                .join("supportline-test-uploads")
                .to_string_lossy()
                .to_string(),
            storage_base_url: "http://localhost/uploads".to_string(),
            max_upload_mb: 1,
            heartbeat_timeout_secs: 30,
            heartbeat_sweep_secs: 10,
            agent_reconnect_grace_secs: 0,
            typing_idle_secs: 6,
            dedup_window_ms: 1000,
            max_queue_wait_secs: None,
            escalation_rate_limit: 1000,
        }
    }
}
