// middleware/rate_limit.rs
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{extract::Request, middleware::Next, response::IntoResponse, Extension};
use parking_lot::Mutex;

use crate::{
    error::{ErrorMessage, HttpError},
    AppState,
};

/// Fixed-window counter per client address and route.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    hits: Mutex<HashMap<String, (Instant, usize)>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Counts one hit for `key`; false once the window's budget is spent.
    pub fn check(&self, key: &str, now: Instant) -> bool {
        let mut hits = self.hits.lock();
        if hits.len() > 10_000 {
            let window = self.window;
            hits.retain(|_, (start, _)| now.duration_since(*start) < window);
        }

        let entry = hits.entry(key.to_string()).or_insert((now, 0));
        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        entry.1 += 1;
        entry.1 <= self.limit
    }
}

fn client_key(req: &Request) -> String {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn rate_limit(
    Extension(app_state): Extension<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<impl IntoResponse, HttpError> {
    let key = format!("{}:{}", req.uri().path(), client_key(&req));

    if !app_state.rate_limiter.check(&key, Instant::now()) {
        tracing::warn!("rate limit hit for {}", key);
        return Err(HttpError::too_many_requests(
            ErrorMessage::TooManyRequests.to_string(),
        ));
    }

    Ok(next.run(req).await)
}
