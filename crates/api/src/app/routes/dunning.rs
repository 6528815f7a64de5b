use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use dunning_core::{CsmId, Currency, Money, SequenceId};
use dunning_infra::{DunningService, OpenSequence};

use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(open_sequence).get(list_active))
        .route("/statistics", get(statistics))
        .route("/revenue-at-risk", get(revenue_at_risk))
        .route("/escalated", get(list_escalated))
        .route("/by-status/:status", get(list_by_status))
        .route("/organization/:org_id", get(list_by_organization))
        .route("/organization/:org_id/active", get(list_active_by_organization))
        .route("/:id", get(get_sequence))
        .route("/:id/retry", post(retry_now))
        .route("/:id/send-link", post(send_payment_link))
        .route("/:id/escalate", post(escalate))
        .route("/:id/assign-csm", post(assign_csm))
        .route("/:id/pause", post(pause))
        .route("/:id/resume", post(resume))
        .route("/:id/cancel", post(cancel))
        .route("/:id/recover", post(recover))
        .route("/:id/notes", post(add_note))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct WindowQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

fn parse_sequence_id(raw: &str) -> Result<SequenceId, axum::response::Response> {
    raw.parse().map_err(|_| {
        errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid sequence id")
    })
}

async fn open_sequence(
    Extension(service): Extension<DunningService>,
    Json(body): Json<dto::OpenSequenceRequest>,
) -> axum::response::Response {
    let organization_id = match body.organization_id.parse() {
        Ok(v) => v,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid organization_id");
        }
    };
    let invoice_id = match body.invoice_id.parse() {
        Ok(v) => v,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid invoice_id");
        }
    };
    let subscription_id = match body.subscription_id.parse() {
        Ok(v) => v,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid subscription_id");
        }
    };
    let currency = match Currency::new(body.currency) {
        Ok(c) => c,
        Err(e) => return errors::error_to_response(e),
    };

    let request = OpenSequence {
        organization_id,
        invoice_id,
        subscription_id,
        amount_at_risk: Money::new(body.amount, currency),
        failure_reason: body.failure_reason,
    };

    match service.open(request, Utc::now()).await {
        Ok(seq) => (StatusCode::CREATED, Json(dto::SequenceResponse::from(&seq))).into_response(),
        Err(e) => errors::error_to_response(e),
    }
}

async fn list_active(
    Extension(service): Extension<DunningService>,
    Query(query): Query<ListQuery>,
) -> axum::response::Response {
    match service.list_active(query.limit.unwrap_or(50)).await {
        Ok(seqs) => Json(dto::sequence_list(&seqs)).into_response(),
        Err(e) => errors::error_to_response(e),
    }
}

async fn list_escalated(
    Extension(service): Extension<DunningService>,
    Query(query): Query<ListQuery>,
) -> axum::response::Response {
    match service.list_escalated(query.limit.unwrap_or(50)).await {
        Ok(seqs) => Json(dto::sequence_list(&seqs)).into_response(),
        Err(e) => errors::error_to_response(e),
    }
}

async fn list_by_status(
    Extension(service): Extension<DunningService>,
    Path(status): Path<String>,
    Query(query): Query<ListQuery>,
) -> axum::response::Response {
    let status = match errors::parse_status(&status) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    match service.list_by_status(status, query.limit.unwrap_or(50)).await {
        Ok(seqs) => Json(dto::sequence_list(&seqs)).into_response(),
        Err(e) => errors::error_to_response(e),
    }
}

async fn list_by_organization(
    Extension(service): Extension<DunningService>,
    Path(org_id): Path<String>,
) -> axum::response::Response {
    let organization_id = match org_id.parse() {
        Ok(v) => v,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid organization id");
        }
    };
    match service.list_by_organization(organization_id).await {
        Ok(seqs) => Json(dto::sequence_list(&seqs)).into_response(),
        Err(e) => errors::error_to_response(e),
    }
}

async fn list_active_by_organization(
    Extension(service): Extension<DunningService>,
    Path(org_id): Path<String>,
) -> axum::response::Response {
    let organization_id = match org_id.parse() {
        Ok(v) => v,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid organization id");
        }
    };
    match service.list_active_by_organization(organization_id).await {
        Ok(seqs) => Json(dto::sequence_list(&seqs)).into_response(),
        Err(e) => errors::error_to_response(e),
    }
}

async fn get_sequence(
    Extension(service): Extension<DunningService>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_sequence_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match service.get(id).await {
        Ok(seq) => Json(dto::SequenceResponse::from(&seq)).into_response(),
        Err(e) => errors::error_to_response(e),
    }
}

async fn statistics(
    Extension(service): Extension<DunningService>,
    Query(window): Query<WindowQuery>,
) -> axum::response::Response {
    let to = window.to.unwrap_or_else(Utc::now);
    let from = window.from.unwrap_or(to - Duration::days(30));
    match service.statistics(from, to).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::error_to_response(e),
    }
}

async fn revenue_at_risk(
    Extension(service): Extension<DunningService>,
) -> axum::response::Response {
    match service.revenue_at_risk(Utc::now()).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => errors::error_to_response(e),
    }
}

async fn retry_now(
    Extension(service): Extension<DunningService>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_sequence_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match service.retry_now(id, Utc::now()).await {
        Ok(seq) => Json(dto::SequenceResponse::from(&seq)).into_response(),
        Err(e) => errors::error_to_response(e),
    }
}

async fn send_payment_link(
    Extension(service): Extension<DunningService>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_sequence_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match service.send_payment_link(id, Utc::now()).await {
        Ok(seq) => Json(dto::SequenceResponse::from(&seq)).into_response(),
        Err(e) => errors::error_to_response(e),
    }
}

fn parse_csm(raw: Option<String>) -> Result<Option<CsmId>, axum::response::Response> {
    match raw {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| {
            errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid csm_id")
        }),
    }
}

async fn escalate(
    Extension(service): Extension<DunningService>,
    Path(id): Path<String>,
    body: Option<Json<dto::EscalateRequest>>,
) -> axum::response::Response {
    let id = match parse_sequence_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let preferred = match parse_csm(body.csm_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match service.escalate(id, preferred, body.note, Utc::now()).await {
        Ok(seq) => Json(dto::SequenceResponse::from(&seq)).into_response(),
        Err(e) => errors::error_to_response(e),
    }
}

async fn assign_csm(
    Extension(service): Extension<DunningService>,
    Path(id): Path<String>,
    body: Option<Json<dto::AssignCsmRequest>>,
) -> axum::response::Response {
    let id = match parse_sequence_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let preferred = match parse_csm(body.map(|Json(b)| b).unwrap_or_default().csm_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match service.assign_csm(id, preferred).await {
        Ok(seq) => Json(dto::SequenceResponse::from(&seq)).into_response(),
        Err(e) => errors::error_to_response(e),
    }
}

async fn pause(
    Extension(service): Extension<DunningService>,
    Path(id): Path<String>,
    body: Option<Json<dto::PauseRequest>>,
) -> axum::response::Response {
    let id = match parse_sequence_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let reason = body.map(|Json(b)| b).unwrap_or_default().reason;
    match service.pause(id, reason, Utc::now()).await {
        Ok(seq) => Json(dto::SequenceResponse::from(&seq)).into_response(),
        Err(e) => errors::error_to_response(e),
    }
}

async fn resume(
    Extension(service): Extension<DunningService>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_sequence_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match service.resume(id, Utc::now()).await {
        Ok(seq) => Json(dto::SequenceResponse::from(&seq)).into_response(),
        Err(e) => errors::error_to_response(e),
    }
}

async fn cancel(
    Extension(service): Extension<DunningService>,
    Path(id): Path<String>,
    body: Option<Json<dto::CancelRequest>>,
) -> axum::response::Response {
    let id = match parse_sequence_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let reason = body.map(|Json(b)| b).unwrap_or_default().reason;
    match service.cancel(id, reason, Utc::now()).await {
        Ok(seq) => Json(dto::SequenceResponse::from(&seq)).into_response(),
        Err(e) => errors::error_to_response(e),
    }
}

async fn recover(
    Extension(service): Extension<DunningService>,
    Path(id): Path<String>,
    body: Option<Json<dto::RecoverRequest>>,
) -> axum::response::Response {
    let id = match parse_sequence_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let method = body.method.unwrap_or_else(|| "manual".to_string());
    match service.mark_recovered(id, method, body.note, Utc::now()).await {
        Ok(seq) => Json(dto::SequenceResponse::from(&seq)).into_response(),
        Err(e) => errors::error_to_response(e),
    }
}

async fn add_note(
    Extension(service): Extension<DunningService>,
    Path(id): Path<String>,
    Json(body): Json<dto::NoteRequest>,
) -> axum::response::Response {
    let id = match parse_sequence_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let author = body.author.unwrap_or_else(|| "operator".to_string());
    match service.add_note(id, author, body.text, Utc::now()).await {
        Ok(seq) => Json(dto::SequenceResponse::from(&seq)).into_response(),
        Err(e) => errors::error_to_response(e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use dunning_infra::{
        DunningService, InMemoryDunningRepository,
    };
    use dunning_sequence::RetryPolicy;

    use crate::app::adapters::{LogNotifier, PlaceholderCsmPool, UnconfiguredGateway};
    use crate::app::build_app;

    fn app() -> axum::Router {
        let service = DunningService::new(
            Arc::new(InMemoryDunningRepository::new()),
            Arc::new(UnconfiguredGateway),
            Arc::new(LogNotifier),
            Arc::new(PlaceholderCsmPool),
            RetryPolicy::default(),
        );
        build_app(service)
    }

    fn open_body() -> String {
        serde_json::json!({
            "organization_id": uuid::Uuid::now_v7().to_string(),
            "invoice_id": uuid::Uuid::now_v7().to_string(),
            "subscription_id": uuid::Uuid::now_v7().to_string(),
            "amount": 50_000,
            "currency": "SAR",
            "failure_reason": "card_declined"
        })
        .to_string()
    }

    async fn json_of(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn open_then_get_round_trips() {
        let app = app();

        let created = app
            .clone()
            .oneshot(
                Request::post("/dunning")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(open_body()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let created = json_of(created).await;
        assert_eq!(created["status"], "active");
        let id = created["id"].as_str().unwrap().to_string();

        let fetched = app
            .oneshot(
                Request::get(format!("/dunning/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(fetched.status(), StatusCode::OK);
        let fetched = json_of(fetched).await;
        assert_eq!(fetched["amount"], 50_000);
        assert_eq!(fetched["currency"], "SAR");
        assert_eq!(fetched["max_attempts"], 5);
    }

    #[tokio::test]
    async fn unknown_sequence_is_404() {
        let response = app()
            .oneshot(
                Request::get(format!("/dunning/{}", uuid::Uuid::now_v7()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_of(response).await["error"], "not_found");
    }

    #[tokio::test]
    async fn malformed_id_is_400() {
        let response = app()
            .oneshot(
                Request::get("/dunning/not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn invalid_status_filter_is_400() {
        let response = app()
            .oneshot(
                Request::get("/dunning/by-status/galloping")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_of(response).await["error"], "invalid_status");
    }

    #[tokio::test]
    async fn cancel_twice_is_unprocessable() {
        let app = app();
        let created = app
            .clone()
            .oneshot(
                Request::post("/dunning")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(open_body()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let id = json_of(created).await["id"].as_str().unwrap().to_string();

        let first = app
            .clone()
            .oneshot(
                Request::post(format!("/dunning/{id}/cancel"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(
                Request::post(format!("/dunning/{id}/cancel"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json_of(second).await["error"], "invalid_transition");
    }

    #[tokio::test]
    async fn early_manual_retry_is_unprocessable() {
        let app = app();
        let created = app
            .clone()
            .oneshot(
                Request::post("/dunning")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(open_body()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let id = json_of(created).await["id"].as_str().unwrap().to_string();

        // First retry is a day out; an immediate manual retry is too early.
        let response = app
            .oneshot(
                Request::post(format!("/dunning/{id}/retry"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json_of(response).await["error"], "too_early_for_retry");
    }

    #[tokio::test]
    async fn pause_then_statistics_reflect_the_book() {
        let app = app();
        let created = app
            .clone()
            .oneshot(
                Request::post("/dunning")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(open_body()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let id = json_of(created).await["id"].as_str().unwrap().to_string();

        let paused = app
            .clone()
            .oneshot(
                Request::post(format!("/dunning/{id}/pause"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"reason":"promised payment"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(paused.status(), StatusCode::OK);
        assert_eq!(json_of(paused).await["status"], "paused");

        let stats = app
            .oneshot(
                Request::get("/dunning/statistics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(stats.status(), StatusCode::OK);
        let stats = json_of(stats).await;
        assert_eq!(stats["by_status"]["paused"], 1);
        assert_eq!(stats["opened"], 1);
    }

    #[tokio::test]
    async fn organization_active_listing_excludes_closed_sequences() {
        let app = app();
        let org = uuid::Uuid::now_v7().to_string();
        let body_for_org = || {
            serde_json::json!({
                "organization_id": org,
                "invoice_id": uuid::Uuid::now_v7().to_string(),
                "subscription_id": uuid::Uuid::now_v7().to_string(),
                "amount": 10_000,
                "currency": "SAR"
            })
            .to_string()
        };

        for _ in 0..2 {
            app.clone()
                .oneshot(
                    Request::post("/dunning")
                        .header(header::CONTENT_TYPE, "application/json")
                        .body(Body::from(body_for_org()))
                        .unwrap(),
                )
                .await
                .unwrap();
        }
        let cancelled = app
            .clone()
            .oneshot(
                Request::post("/dunning")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body_for_org()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let id = json_of(cancelled).await["id"].as_str().unwrap().to_string();
        app.clone()
            .oneshot(
                Request::post(format!("/dunning/{id}/cancel"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let all = app
            .clone()
            .oneshot(
                Request::get(format!("/dunning/organization/{org}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(json_of(all).await.as_array().unwrap().len(), 3);

        let active = app
            .oneshot(
                Request::get(format!("/dunning/organization/{org}/active"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(active.status(), StatusCode::OK);
        let active = json_of(active).await;
        let active = active.as_array().unwrap();
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|s| s["status"] == "active"));
    }

    #[tokio::test]
    async fn revenue_at_risk_reports_open_exposure() {
        let app = app();
        app.clone()
            .oneshot(
                Request::post("/dunning")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(open_body()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let report = app
            .oneshot(
                Request::get("/dunning/revenue-at-risk")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(report.status(), StatusCode::OK);
        let report = json_of(report).await;
        assert_eq!(report["currencies"][0]["currency"], "SAR");
        assert_eq!(report["currencies"][0]["total"], 50_000);
    }
}
