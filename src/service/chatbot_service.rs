// service/chatbot_service.rs
use std::sync::Arc;

use uuid::Uuid;
use validator::Validate;

use crate::{
    db::{conversationdb::ConversationExt, messagedb::MessageExt, SupportStore},
    dtos::chatdtos::{AskChatbotDto, ChatbotAnswerDto},
    models::{
        chatmodel::{NewMessage, SenderType},
        conversationmodel::ChatbotSettings,
    },
    service::{
        ai_service::{AnswerRequest, AnswerSource, HistoryTurn},
        error::ServiceError,
    },
};

#[derive(Debug, Clone)]
pub struct ChatbotService {
    store: Arc<dyn SupportStore>,
    ai: Arc<dyn AnswerSource>,
}

impl ChatbotService {
    pub fn new(store: Arc<dyn SupportStore>, ai: Arc<dyn AnswerSource>) -> Self {
        Self { store, ai }
    }

    pub async fn settings(&self, business_id: Uuid) -> Result<ChatbotSettings, ServiceError> {
        self.store
            .get_chatbot_settings(business_id)
            .await?
            .ok_or(ServiceError::BusinessNotFound(business_id))
    }

    pub async fn update_settings(
        &self,
        business_id: Uuid,
        enable_live_chat: bool,
    ) -> Result<ChatbotSettings, ServiceError> {
        let settings = self
            .store
            .upsert_chatbot_settings(business_id, enable_live_chat)
            .await?;
        tracing::info!("business {} live chat enabled: {}", business_id, enable_live_chat);
        Ok(settings)
    }

    /// Stores the question, asks the AI with the conversation so far and
    /// stores the answer. A new conversation is opened when no session id is
    /// given.
    pub async fn ask(&self, body: AskChatbotDto) -> Result<ChatbotAnswerDto, ServiceError> {
        body.validate()
            .map_err(|e| ServiceError::Validation(e.to_string()))?;
        self.settings(body.business_id).await?;

        let session_id = match body.session_id.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
            Some(session_id) => {
                self.store
                    .get_conversation(&session_id)
                    .await?
                    .filter(|c| c.business_id == body.business_id)
                    .ok_or_else(|| ServiceError::ConversationNotFound(session_id.clone()))?;
                session_id
            }
            None => {
                let session_id = Uuid::new_v4().to_string();
                self.store
                    .create_conversation(body.business_id, &session_id)
                    .await?;
                tracing::info!("conversation {} opened for business {}", session_id, body.business_id);
                session_id
            }
        };

        let history: Vec<HistoryTurn> = self
            .store
            .list_messages_by_session(&session_id)
            .await?
            .into_iter()
            .filter_map(|m| {
                let role = match m.sender_type {
                    SenderType::Customer => "user",
                    SenderType::Ai | SenderType::Agent => "assistant",
                    SenderType::System => return None,
                };
                m.body.map(|content| HistoryTurn {
                    role: role.to_string(),
                    content,
                })
            })
            .collect();

        let query = body.query.trim().to_string();
        self.store
            .append_message(NewMessage::text(
                body.business_id,
                session_id.clone(),
                None,
                SenderType::Customer,
                query.clone(),
            ))
            .await?;

        let response = self
            .ai
            .answer(AnswerRequest {
                query,
                history,
                session_id: Some(session_id.clone()),
            })
            .await?;

        self.store
            .append_message(NewMessage::text(
                body.business_id,
                session_id.clone(),
                None,
                SenderType::Ai,
                response.answer.clone(),
            ))
            .await?;

        Ok(ChatbotAnswerDto {
            answer: response.answer,
            session_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::memory::MemoryStore, service::ai_service::AnswerResponse};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct ScriptedAi {
        fail: bool,
        seen: Mutex<Vec<AnswerRequest>>,
    }

    #[async_trait]
    impl AnswerSource for ScriptedAi {
        async fn answer(&self, request: AnswerRequest) -> Result<AnswerResponse, ServiceError> {
            self.seen.lock().push(request.clone());
            if self.fail {
                return Err(ServiceError::Upstream("model offline".into()));
            }
            Ok(AnswerResponse {
                answer: format!("echo: {}", request.query),
                session_id: request.session_id,
            })
        }
    }

    async fn setup(fail: bool) -> (ChatbotService, Arc<MemoryStore>, Arc<ScriptedAi>, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let business = Uuid::new_v4();
        store.upsert_chatbot_settings(business, true).await.unwrap();
        let ai = Arc::new(ScriptedAi {
            fail,
            ..Default::default()
        });
        let dyn_store: Arc<dyn SupportStore> = store.clone();
        let service = ChatbotService::new(dyn_store, ai.clone());
        (service, store, ai, business)
    }

    fn ask(business: Uuid, query: &str, session_id: Option<String>) -> AskChatbotDto {
        AskChatbotDto {
            business_id: business,
            query: query.into(),
            session_id,
        }
    }

    #[tokio::test]
    async fn first_question_opens_conversation_and_stores_both_turns() {
        let (service, store, ai, business) = setup(false).await;

        let first = service.ask(ask(business, "hello", None)).await.unwrap();
        assert_eq!(first.answer, "echo: hello");

        let second = service
            .ask(ask(business, "and shipping?", Some(first.session_id.clone())))
            .await
            .unwrap();
        assert_eq!(second.session_id, first.session_id);

        let stored = store.list_messages_by_session(&first.session_id).await.unwrap();
        let senders: Vec<SenderType> = stored.iter().map(|m| m.sender_type).collect();
        assert_eq!(
            senders,
            vec![SenderType::Customer, SenderType::Ai, SenderType::Customer, SenderType::Ai]
        );

        let seen = ai.seen.lock();
        assert_eq!(seen[1].history.len(), 2);
        assert_eq!(seen[1].history[0].role, "user");
    }

    #[tokio::test]
    async fn upstream_failure_keeps_the_question() {
        let (service, store, _, business) = setup(true).await;
        let conversation = Uuid::new_v4().to_string();
        store.create_conversation(business, &conversation).await.unwrap();

        let err = service
            .ask(ask(business, "help", Some(conversation.clone())))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Upstream(_)));
        assert_eq!(store.list_messages_by_session(&conversation).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_business_or_session_is_not_found() {
        let (service, _, _, business) = setup(false).await;
        assert!(matches!(
            service.ask(ask(Uuid::new_v4(), "hi", None)).await,
            Err(ServiceError::BusinessNotFound(_))
        ));
        assert!(matches!(
            service.ask(ask(business, "hi", Some("missing".into()))).await,
            Err(ServiceError::ConversationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let (service, _, _, business) = setup(false).await;
        assert!(service.settings(business).await.unwrap().enable_live_chat);
        service.update_settings(business, false).await.unwrap();
        assert!(!service.settings(business).await.unwrap().enable_live_chat);
    }
}
