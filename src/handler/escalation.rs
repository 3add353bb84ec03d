// handler/escalation.rs
use std::sync::Arc;

use axum::{
    extract::{Path, Query},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, patch, post},
    Extension, Json, Router,
};
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use crate::{
    dtos::escalationdtos::{
        CaseLookupQuery, CreateEscalationDto, EscalationListQuery, UpdateOwnerDto, UpdateStatusDto,
    },
    error::HttpError,
    middleware::rate_limit,
    AppState,
};

pub fn escalation_handler() -> Router {
    Router::new()
        .route(
            "/",
            post(create_escalation)
                .layer(middleware::from_fn(rate_limit))
                .get(list_escalations),
        )
        .route("/case/:case_number", get(get_by_case_number))
        .route("/:escalation_id", get(get_escalation))
        .route("/:escalation_id/status", patch(update_status))
        .route("/:escalation_id/case-owner", patch(update_case_owner))
        .route("/:escalation_id/activity", get(get_activity))
}

pub async fn create_escalation(
    Extension(app_state): Extension<Arc<AppState>>,
    Json(body): Json<CreateEscalationDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let escalation = app_state
        .escalation_service
        .create_escalation(body)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "status": "success",
            "message": "Escalation created",
            "data": escalation,
        })),
    ))
}

pub async fn list_escalations(
    Query(query): Query<EscalationListQuery>,
    Extension(app_state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpError> {
    let escalations = app_state.escalation_service.list(&query).await?;

    Ok(Json(json!({
        "status": "success",
        "data": escalations,
        "count": escalations.len(),
    })))
}

pub async fn get_by_case_number(
    Path(case_number): Path<String>,
    Query(query): Query<CaseLookupQuery>,
    Extension(app_state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpError> {
    let escalation = app_state
        .escalation_service
        .get_by_case_number(&case_number, query.business_id)
        .await?;

    Ok(Json(json!({
        "status": "success",
        "data": escalation,
    })))
}

pub async fn get_escalation(
    Path(escalation_id): Path<Uuid>,
    Extension(app_state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpError> {
    let escalation = app_state.escalation_service.get(escalation_id).await?;
    let session = app_state.live_chat.session(escalation_id).await;

    Ok(Json(json!({
        "status": "success",
        "data": {
            "escalation": escalation,
            "liveChat": session,
            "queuePosition": app_state.queue.position(escalation_id),
        },
    })))
}

pub async fn update_status(
    Path(escalation_id): Path<Uuid>,
    Extension(app_state): Extension<Arc<AppState>>,
    Json(body): Json<UpdateStatusDto>,
) -> Result<impl IntoResponse, HttpError> {
    let escalation = app_state
        .escalation_service
        .update_status(escalation_id, body.status)
        .await?;

    Ok(Json(json!({
        "status": "success",
        "data": escalation,
    })))
}

pub async fn update_case_owner(
    Path(escalation_id): Path<Uuid>,
    Extension(app_state): Extension<Arc<AppState>>,
    Json(body): Json<UpdateOwnerDto>,
) -> Result<impl IntoResponse, HttpError> {
    let escalation = app_state
        .escalation_service
        .update_owner(escalation_id, body.case_owner)
        .await?;

    Ok(Json(json!({
        "status": "success",
        "data": escalation,
    })))
}

pub async fn get_activity(
    Path(escalation_id): Path<Uuid>,
    Extension(app_state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpError> {
    let activities = app_state.escalation_service.activities(escalation_id).await?;

    Ok(Json(json!({
        "status": "success",
        "data": activities,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::conversationdb::ConversationExt;
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
        let router = escalation_handler().layer(Extension(app_state.clone()));
        (router, app_state, business)
    }

    fn create_request(business: Uuid, email: &str) -> Request<Body> {
        let body = json!({
            "businessId": business,
            "sessionId": "sess-1",
            "customerName": "Jane Doe",
            "customerEmail": email,
            "concern": "Billing",
        });
        Request::post("/")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn create_then_continue_by_case_number() {
        let (router, _, business) = app().await;

        let response = router
            .clone()
            .oneshot(create_request(business, "jane@x.com"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = json_body(response).await;
        let case_number = created["data"]["caseNumber"].as_str().unwrap().to_string();
        assert_eq!(created["data"]["status"], "escalated");

        let response = router
            .oneshot(
                Request::get(format!("/case/{}?businessId={}", case_number, business))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["data"]["caseNumber"], case_number);
    }

    #[tokio::test]
    async fn invalid_email_is_400_with_fail_shape() {
        let (router, _, business) = app().await;
        let response = router
            .oneshot(create_request(business, "not-an-email"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["status"], "fail");
    }

    #[tokio::test]
    async fn unknown_case_is_404() {
        let (router, _, business) = app().await;
        let response = router
            .oneshot(
                Request::get(format!("/case/CASE-2024-01-999999?businessId={}", business))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_update_is_recorded_in_activity() {
        let (router, _, business) = app().await;
        let created = json_body(
            router
                .clone()
                .oneshot(create_request(business, "jane@x.com"))
                .await
                .unwrap(),
        )
        .await;
        let id = created["data"]["_id"].as_str().unwrap().to_string();

        let response = router
            .clone()
            .oneshot(
                Request::patch(format!("/{}/status", id))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"status":"resolved"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["data"]["status"], "resolved");

        let feed = json_body(
            router
                .oneshot(
                    Request::get(format!("/{}/activity", id))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(feed["data"].as_array().unwrap().len(), 2);
    }
}
