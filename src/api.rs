//! Operator HTTP API for reviewing and approving users.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::ApprovalError;
use crate::kyc::{Approval, ApprovalCoordinator, User, VerificationStatus};
use crate::store::Database;

/// Shared state for the API routes.
#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<dyn Database>,
    pub approvals: Arc<ApprovalCoordinator>,
}

/// Public view of a user, without the signing key.
#[derive(Debug, Serialize, Deserialize)]
pub struct UserView {
    pub user_key: String,
    pub username: Option<String>,
    pub status: VerificationStatus,
    pub kyc: bool,
    pub full_name: String,
    pub birthdate: NaiveDate,
    pub phone: String,
    pub email: String,
    pub wallet_address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            user_key: user.user_key.clone(),
            username: user.username.clone(),
            status: user.status,
            kyc: user.is_approved(),
            full_name: user.profile.full_name.clone(),
            birthdate: user.profile.birthdate,
            phone: user.profile.phone.clone(),
            email: user.profile.email.clone(),
            wallet_address: user.account_address().map(str::to_string),
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UsersQuery {
    pub kyc: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct KycUpdate {
    pub kyc: bool,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// GET /health
async fn health(State(state): State<ApiState>) -> Response {
    match state.db.ping().await {
        Ok(()) => Json(serde_json::json!({ "status": "healthy" })).into_response(),
        Err(e) => {
            tracing::warn!("Health check failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "unhealthy" })),
            )
                .into_response()
        }
    }
}

/// GET /api/v1/users?kyc=true|false
async fn list_users(State(state): State<ApiState>, Query(query): Query<UsersQuery>) -> Response {
    let status = query.kyc.map(|kyc| {
        if kyc {
            VerificationStatus::Approved
        } else {
            VerificationStatus::Pending
        }
    });
    match state.db.list_users(status).await {
        Ok(users) => {
            let views: Vec<UserView> = users.iter().map(UserView::from).collect();
            Json(views).into_response()
        }
        Err(e) => {
            tracing::error!("Failed to list users: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable")
        }
    }
}

/// GET /api/v1/users/{id}
async fn get_user(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.db.get_user(&id).await {
        Ok(Some(user)) => Json(UserView::from(&user)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("user {id} not found")),
        Err(e) => {
            tracing::error!(user = %id, "Failed to load user: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable")
        }
    }
}

/// PATCH /api/v1/users/{id}
///
/// `{"kyc": true}` approves the user and provisions their account. Safe to
/// repeat: an already provisioned user is returned unchanged.
async fn update_user(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<KycUpdate>,
) -> Response {
    if !body.kyc {
        return error_response(StatusCode::BAD_REQUEST, "revoking verification is not supported");
    }

    match state.approvals.approve(&id).await {
        Ok(approval) => {
            if let Approval::Provisioned(user) = &approval {
                tracing::info!(user = %id, address = ?user.account_address(), "User approved");
            }
            Json(UserView::from(approval.user())).into_response()
        }
        Err(ApprovalError::UserNotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, format!("user {id} not found"))
        }
        Err(e @ ApprovalError::InProgress(_)) => error_response(StatusCode::CONFLICT, e.to_string()),
        Err(e @ ApprovalError::Ledger(_)) => {
            error_response(StatusCode::BAD_GATEWAY, e.to_string())
        }
        Err(e @ ApprovalError::Database(_)) => {
            tracing::error!(user = %id, "Approval failed: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable")
        }
    }
}

/// Build the operator API router.
pub fn api_routes(state: ApiState) -> Router {
    let v1 = Router::new()
        .route("/users", get(list_users))
        .route("/users/{id}", get(get_user).patch(update_user));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", v1)
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, header};
    use chrono::NaiveDate;
    use tower::util::ServiceExt;

    use super::*;
    use crate::config::RetryPolicy;
    use crate::kyc::Profile;
    use crate::notify::NotificationRetrier;
    use crate::store::LibSqlBackend;
    use crate::testing::{FakeLedger, RecordingNotifier, unavailable};

    struct Harness {
        app: Router,
        db: Arc<dyn Database>,
        ledger: Arc<FakeLedger>,
        notifier: Arc<RecordingNotifier>,
        retrier: Arc<NotificationRetrier>,
    }

    async fn harness() -> Harness {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let ledger = Arc::new(FakeLedger::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let retrier = Arc::new(NotificationRetrier::new(
            notifier.clone(),
            RetryPolicy::default(),
        ));
        let approvals = Arc::new(ApprovalCoordinator::new(
            Arc::clone(&db),
            ledger.clone(),
            Arc::clone(&retrier),
            Duration::from_secs(300),
        ));
        let app = api_routes(ApiState {
            db: Arc::clone(&db),
            approvals,
        });
        Harness {
            app,
            db,
            ledger,
            notifier,
            retrier,
        }
    }

    async fn submit(db: &Arc<dyn Database>, user_key: &str) {
        db.upsert_profile(
            user_key,
            Some("ana"),
            &Profile {
                full_name: "Ana".into(),
                birthdate: NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
                phone: "555-0100".into(),
                email: "a@example.com".into(),
            },
        )
        .await
        .unwrap();
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn patch(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("PATCH")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let h = harness().await;
        let response = h.app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn unknown_user_is_404() {
        let h = harness().await;
        let response = h.app.clone().oneshot(get("/api/v1/users/nobody")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = h
            .app
            .oneshot(patch("/api/v1/users/nobody", r#"{"kyc":true}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(h.ledger.create_count(), 0);
    }

    #[tokio::test]
    async fn approve_provisions_once_and_hides_signing_key() {
        let h = harness().await;
        submit(&h.db, "42").await;

        let response = h
            .app
            .clone()
            .oneshot(patch("/api/v1/users/42", r#"{"kyc":true}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["status"], "approved");
        assert_eq!(body["kyc"], true);
        assert_eq!(body["wallet_address"], "0xacct0");
        assert!(body.get("signing_key").is_none());
        assert!(!body.to_string().contains("key0"));

        let response = h
            .app
            .clone()
            .oneshot(patch("/api/v1/users/42", r#"{"kyc":true}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["wallet_address"], "0xacct0");
        assert_eq!(h.ledger.create_count(), 1);

        h.retrier.drain().await;
        assert_eq!(h.notifier.messages().len(), 1);
    }

    #[tokio::test]
    async fn revocation_is_rejected() {
        let h = harness().await;
        submit(&h.db, "42").await;
        let response = h
            .app
            .oneshot(patch("/api/v1/users/42", r#"{"kyc":false}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ledger_failure_is_bad_gateway_and_retryable() {
        let h = harness().await;
        submit(&h.db, "42").await;
        h.ledger.fail_next_create(unavailable("create_account"));

        let response = h
            .app
            .clone()
            .oneshot(patch("/api/v1/users/42", r#"{"kyc":true}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let response = h
            .app
            .oneshot(patch("/api/v1/users/42", r#"{"kyc":true}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn list_filters_by_kyc() {
        let h = harness().await;
        submit(&h.db, "1").await;
        submit(&h.db, "2").await;
        h.app
            .clone()
            .oneshot(patch("/api/v1/users/2", r#"{"kyc":true}"#))
            .await
            .unwrap();

        let all = json(h.app.clone().oneshot(get("/api/v1/users")).await.unwrap()).await;
        assert_eq!(all.as_array().unwrap().len(), 2);

        let pending = json(
            h.app
                .clone()
                .oneshot(get("/api/v1/users?kyc=false"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(pending.as_array().unwrap().len(), 1);
        assert_eq!(pending[0]["user_key"], "1");

        let approved = json(h.app.oneshot(get("/api/v1/users?kyc=true")).await.unwrap()).await;
        assert_eq!(approved[0]["user_key"], "2");
    }
}
