// service/ai_service.rs
//
// Client for the chatbot answer service. The escalation core only needs
// `query + history -> answer`; everything else about the model lives
// behind AI_SERVICE_URL.
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{config::Config, service::error::ServiceError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRequest {
    pub query: String,
    pub history: Vec<HistoryTurn>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerResponse {
    pub answer: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[async_trait]
pub trait AnswerSource: Send + Sync + std::fmt::Debug {
    async fn answer(&self, request: AnswerRequest) -> Result<AnswerResponse, ServiceError>;
}

#[derive(Debug, Clone)]
pub struct AiClient {
    client: reqwest::Client,
    base_url: String,
}

impl AiClient {
    pub fn new(config: &Config) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.ai_timeout_secs))
            .build()
            .map_err(|e| ServiceError::Upstream(format!("failed to build AI client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.ai_service_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl AnswerSource for AiClient {
    async fn answer(&self, request: AnswerRequest) -> Result<AnswerResponse, ServiceError> {
        let url = format!("{}/answer", self.base_url);
        tracing::debug!("asking AI service at {} ({} history turns)", url, request.history.len());

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ServiceError::Upstream(format!("AI service unreachable: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!("AI service returned {}: {}", status, body);
            return Err(ServiceError::Upstream(format!("AI service returned {}", status)));
        }

        let answer: AnswerResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::Upstream(format!("AI service sent an unreadable answer: {}", e)))?;

        if answer.answer.trim().is_empty() {
            return Err(ServiceError::Upstream("AI service returned an empty answer".to_string()));
        }
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_camel_case_keys() {
        let request = AnswerRequest {
            query: "Where is my order?".into(),
            history: vec![HistoryTurn {
                role: "user".into(),
                content: "hi".into(),
            }],
            session_id: Some("s1".into()),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["history"][0]["role"], "user");
    }

    #[tokio::test]
    async fn unreachable_service_is_an_upstream_error() {
        let client = AiClient::new(&Config::for_tests()).unwrap();
        let result = client
            .answer(AnswerRequest {
                query: "hello".into(),
                history: vec![],
                session_id: None,
            })
            .await;
        assert!(matches!(result, Err(ServiceError::Upstream(_))));
    }
}
