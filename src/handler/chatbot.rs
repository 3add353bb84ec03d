// handler/chatbot.rs
use std::sync::Arc;

use axum::{
    extract::Path,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use crate::{
    dtos::chatdtos::{AskChatbotDto, UpdateChatbotSettingsDto},
    error::HttpError,
    middleware::rate_limit,
    service::error::ServiceError,
    AppState,
};

pub fn chatbot_handler() -> Router {
    Router::new()
        .route("/ask", post(ask).layer(middleware::from_fn(rate_limit)))
        .route(
            "/settings/:business_id",
            get(get_settings).put(update_settings),
        )
}

pub async fn ask(
    Extension(app_state): Extension<Arc<AppState>>,
    Json(body): Json<AskChatbotDto>,
) -> Result<Response, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;
    let business_id = body.business_id;

    match app_state.chatbot.ask(body).await {
        Ok(answer) => Ok(Json(json!({
            "status": "success",
            "data": answer,
        }))
        .into_response()),
        // The widget offers a human when the bot cannot answer.
        Err(ServiceError::Upstream(e)) => {
            tracing::error!("chatbot answer failed for business {}: {}", business_id, e);
            let live_chat_available = app_state
                .chatbot
                .settings(business_id)
                .await
                .map(|s| s.enable_live_chat)
                .unwrap_or(false);

            Ok((
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "status": "fail",
                    "message": "The assistant is unavailable right now",
                    "liveChatAvailable": live_chat_available,
                })),
            )
                .into_response())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn get_settings(
    Path(business_id): Path<Uuid>,
    Extension(app_state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpError> {
    let settings = app_state.chatbot.settings(business_id).await?;

    Ok(Json(json!({
        "status": "success",
        "data": settings,
    })))
}

pub async fn update_settings(
    Path(business_id): Path<Uuid>,
    Extension(app_state): Extension<Arc<AppState>>,
    Json(body): Json<UpdateChatbotSettingsDto>,
) -> Result<impl IntoResponse, HttpError> {
    let settings = app_state
        .chatbot
        .update_settings(business_id, body.enable_live_chat)
        .await?;

    Ok(Json(json!({
        "status": "success",
        "data": settings,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn unreachable_ai_reports_live_chat_availability() {
        let app_state = Arc::new(AppState::for_tests());
        let router = chatbot_handler().layer(Extension(app_state.clone()));
        let business = Uuid::new_v4();

        let response = router
            .clone()
            .oneshot(
                Request::put(format!("/settings/{}", business))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"enableLiveChat":true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(
                Request::post("/ask")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({ "businessId": business, "query": "Where is my order?" }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(response).await;
        assert_eq!(body["status"], "fail");
        assert_eq!(body["liveChatAvailable"], true);
    }

    #[tokio::test]
    async fn settings_for_unknown_business_are_404() {
        let app_state = Arc::new(AppState::for_tests());
        let router = chatbot_handler().layer(Extension(app_state));
        let response = router
            .oneshot(
                Request::get(format!("/settings/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
