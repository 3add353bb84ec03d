// handler/chat.rs
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Extension, Json, Router,
};
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use crate::{
    db::messagedb::MessageExt,
    dtos::chatdtos::{EndChatDto, SendMessageDto, UpdateAvailabilityDto},
    error::{ErrorMessage, HttpError},
    models::chatmodel::SenderType,
    service::{error::ServiceError, live_chat_service::EndedBy},
    AppState,
};

pub fn chat_handler() -> Router {
    Router::new()
        .route("/send-message", post(send_message))
        .route(
            "/send-message-with-file",
            post(send_message_with_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/session/:session_id", get(get_session_messages))
        .route("/:escalation_id/end", post(end_chat))
}

pub fn queue_handler() -> Router {
    Router::new()
        .route("/queue/:business_id", get(get_queue))
        .route("/agents/:agent_id/availability", put(update_availability))
}

pub async fn send_message(
    Extension(app_state): Extension<Arc<AppState>>,
    Json(body): Json<SendMessageDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let message = app_state
        .live_chat
        .post_message(
            body.business_id,
            &body.session_id,
            body.escalation_id,
            body.sender_type,
            Some(body.message),
            Vec::new(),
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "status": "success",
            "data": message,
        })),
    ))
}

#[derive(Debug, Default)]
struct UploadForm {
    business_id: Option<Uuid>,
    session_id: Option<String>,
    escalation_id: Option<Uuid>,
    sender_type: Option<SenderType>,
    message: Option<String>,
    file: Option<(String, String, Vec<u8>)>,
}

fn parse_uuid(field: &str, value: &str) -> Result<Uuid, HttpError> {
    Uuid::parse_str(value.trim())
        .map_err(|_| HttpError::bad_request(format!("{} is not a valid id", field)))
}

async fn read_upload_form(mut multipart: Multipart, max_bytes: usize) -> Result<UploadForm, HttpError> {
    let mut form = UploadForm::default();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|_| HttpError::bad_request(ErrorMessage::InvalidMultipart.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let file_name = field.file_name().unwrap_or("upload").to_string();
            let mime_type = field
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string();

            let mut bytes = Vec::new();
            while let Some(chunk) = field
                .chunk()
                .await
                .map_err(|_| HttpError::bad_request(ErrorMessage::InvalidMultipart.to_string()))?
            {
                if bytes.len() + chunk.len() > max_bytes {
                    return Err(HttpError::payload_too_large(
                        ErrorMessage::PayloadTooLarge.to_string(),
                    ));
                }
                bytes.extend_from_slice(&chunk);
            }
            form.file = Some((file_name, mime_type, bytes));
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|_| HttpError::bad_request(ErrorMessage::InvalidMultipart.to_string()))?;
        match name.as_str() {
            "businessId" => form.business_id = Some(parse_uuid("businessId", &value)?),
            "sessionId" => form.session_id = Some(value),
            "escalationId" if !value.trim().is_empty() => {
                form.escalation_id = Some(parse_uuid("escalationId", &value)?)
            }
            "senderType" => {
                form.sender_type = Some(
                    serde_json::from_value(serde_json::Value::String(value.trim().to_string()))
                        .map_err(|_| HttpError::bad_request("senderType is invalid"))?,
                )
            }
            "message" => form.message = Some(value),
            _ => {}
        }
    }

    Ok(form)
}

pub async fn send_message_with_file(
    Extension(app_state): Extension<Arc<AppState>>,
    multipart: Multipart,
) -> Result<impl IntoResponse, HttpError> {
    let form = read_upload_form(multipart, app_state.storage.max_bytes()).await?;

    let business_id = form
        .business_id
        .ok_or_else(|| HttpError::bad_request("businessId is required"))?;
    let session_id = form
        .session_id
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| HttpError::bad_request("sessionId is required"))?;
    let sender_type = form
        .sender_type
        .ok_or_else(|| HttpError::bad_request("senderType is required"))?;
    let (file_name, mime_type, bytes) = form
        .file
        .ok_or_else(|| HttpError::bad_request("file is required"))?;

    app_state
        .live_chat
        .check_post(business_id, &session_id, form.escalation_id, sender_type)
        .await?;

    let attachment = app_state
        .storage
        .store(&file_name, &mime_type, &bytes)
        .await?;

    let message = app_state
        .live_chat
        .post_message(
            business_id,
            &session_id,
            form.escalation_id,
            sender_type,
            form.message,
            vec![attachment],
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "status": "success",
            "data": message,
        })),
    ))
}

pub async fn get_session_messages(
    Path(session_id): Path<String>,
    Extension(app_state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpError> {
    let messages = app_state
        .store
        .list_messages_by_session(&session_id)
        .await
        .map_err(ServiceError::from)?;

    Ok(Json(json!({
        "status": "success",
        "data": messages,
        "count": messages.len(),
    })))
}

pub async fn end_chat(
    Path(escalation_id): Path<Uuid>,
    Extension(app_state): Extension<Arc<AppState>>,
    body: Option<Json<EndChatDto>>,
) -> Result<impl IntoResponse, HttpError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let ended_by = match body.agent_id {
        Some(agent_id) => EndedBy::Agent(agent_id),
        None => EndedBy::System,
    };

    app_state.live_chat.end_chat(escalation_id, ended_by).await?;

    Ok(Json(json!({
        "status": "success",
        "message": "Chat ended",
    })))
}

pub async fn get_queue(
    Path(business_id): Path<Uuid>,
    Extension(app_state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpError> {
    let snapshot = app_state.queue.snapshot(business_id);

    Ok(Json(json!({
        "status": "success",
        "data": snapshot,
    })))
}

pub async fn update_availability(
    Path(agent_id): Path<Uuid>,
    Extension(app_state): Extension<Arc<AppState>>,
    Json(body): Json<UpdateAvailabilityDto>,
) -> Result<impl IntoResponse, HttpError> {
    let presence = app_state
        .live_chat
        .set_availability(agent_id, body.business_id, body.availability)
        .await?;

    Ok(Json(json!({
        "status": "success",
        "data": presence,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::conversationdb::ConversationExt;
    use crate::models::chatmodel::Attachment;
    use crate::service::storage_service::FileStorage;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn app() -> (Router, Arc<AppState>, Uuid) {
        let app_state = Arc::new(AppState::for_tests());
        let business = Uuid::new_v4();
        app_state
            .store
            .create_conversation(business, "sess-1")
            .await
            .unwrap();
        let router = Router::new()
            .nest("/chat", chat_handler())
            .merge(queue_handler())
            .layer(Extension(app_state.clone()));
        (router, app_state, business)
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn multipart(business: Uuid, file: &[u8]) -> Request<Body> {
        upload(business, "sess-1", "customer", file)
    }

    fn upload(business: Uuid, session_id: &str, sender_type: &str, file: &[u8]) -> Request<Body> {
        let boundary = "XBOUNDARY";
        let mut body = Vec::new();
        for (name, value) in [
            ("businessId", business.to_string()),
            ("sessionId", session_id.to_string()),
            ("senderType", sender_type.to_string()),
        ] {
            body.extend_from_slice(
                format!(
                    "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"note.txt\"\r\nContent-Type: text/plain\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(file);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        Request::post("/chat/send-message-with-file")
            .header("content-type", format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn posted_messages_are_listed_in_order() {
        let (router, _, business) = app().await;

        for text in ["first", "second"] {
            let response = router
                .clone()
                .oneshot(post_json(
                    "/chat/send-message",
                    json!({
                        "businessId": business,
                        "sessionId": "sess-1",
                        "message": text,
                        "senderType": "customer",
                    }),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let listed = json_body(
            router
                .oneshot(Request::get("/chat/session/sess-1").body(Body::empty()).unwrap())
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(listed["count"], 2);
        assert_eq!(listed["data"][0]["body"], "first");
        assert_eq!(listed["data"][1]["body"], "second");
    }

    #[tokio::test]
    async fn system_sender_is_rejected() {
        let (router, _, business) = app().await;
        let response = router
            .oneshot(post_json(
                "/chat/send-message",
                json!({
                    "businessId": business,
                    "sessionId": "sess-1",
                    "message": "spoof",
                    "senderType": "system",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn file_upload_becomes_an_attachment() {
        let (router, _, business) = app().await;
        let response = router.oneshot(multipart(business, b"hello file")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let body = json_body(response).await;
        let attachment = &body["data"]["attachments"][0];
        assert_eq!(attachment["fileName"], "note.txt");
        assert_eq!(attachment["fileSize"], 10);
        assert_eq!(attachment["mimeType"], "text/plain");
    }

    #[derive(Debug, Default)]
    struct CountingStorage {
        stored: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl FileStorage for CountingStorage {
        async fn store(
            &self,
            file_name: &str,
            mime_type: &str,
            bytes: &[u8],
        ) -> Result<Attachment, ServiceError> {
            self.stored.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Attachment {
                file_name: file_name.to_string(),
                file_url: format!("http://localhost/uploads/{}", file_name),
                file_size: bytes.len() as i64,
                mime_type: mime_type.to_string(),
            })
        }

        fn max_bytes(&self) -> usize {
            1024
        }
    }

    #[tokio::test]
    async fn rejected_upload_writes_no_file() {
        let storage = Arc::new(CountingStorage::default());
        let app_state = Arc::new(AppState {
            storage: storage.clone(),
            ..AppState::for_tests()
        });
        let business = Uuid::new_v4();
        app_state
            .store
            .create_conversation(business, "sess-1")
            .await
            .unwrap();
        let router = Router::new()
            .nest("/chat", chat_handler())
            .layer(Extension(app_state));

        let unknown = router
            .clone()
            .oneshot(upload(business, "missing", "customer", b"orphan"))
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let wrong_business = router
            .clone()
            .oneshot(upload(Uuid::new_v4(), "sess-1", "customer", b"orphan"))
            .await
            .unwrap();
        assert_eq!(wrong_business.status(), StatusCode::NOT_FOUND);

        let system = router
            .clone()
            .oneshot(upload(business, "sess-1", "system", b"orphan"))
            .await
            .unwrap();
        assert_eq!(system.status(), StatusCode::BAD_REQUEST);
        assert_eq!(storage.stored.load(std::sync::atomic::Ordering::SeqCst), 0);

        let accepted = router.oneshot(multipart(business, b"kept")).await.unwrap();
        assert_eq!(accepted.status(), StatusCode::CREATED);
        assert_eq!(storage.stored.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oversized_upload_is_413() {
        let (router, app_state, business) = app().await;
        let big = vec![b'a'; app_state.storage.max_bytes() + 1];
        let response = router.oneshot(multipart(business, &big)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn ending_an_unknown_chat_is_404() {
        let (router, _, _) = app().await;
        let response = router
            .oneshot(
                Request::post(format!("/chat/{}/end", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn availability_shows_up_in_queue_snapshot() {
        let (router, _, business) = app().await;
        let agent = Uuid::new_v4();

        let response = router
            .clone()
            .oneshot(
                Request::put(format!("/agents/{}/availability", agent))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({ "businessId": business, "availability": "available" }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["data"]["availability"], "available");

        let snapshot = json_body(
            router
                .oneshot(
                    Request::get(format!("/queue/{}", business))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(snapshot["status"], "success");
    }
}
