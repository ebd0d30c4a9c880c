use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use fieldsync_core::db::Database;
use fieldsync_core::models::{QueueEntryView, QueueStats, StoredRecord, SyncConflict, SyncEntity};
use fieldsync_core::normalize::wire_record;
use fieldsync_core::services::{
    CallerStats, NewCase, NewDiagnosis, NewPatient, NewVitals, RecordService,
};
use fieldsync_core::Role;
use fieldsync_core::sync::{SyncRequest, SyncResponse, SyncService};
use fieldsync_core::util::user_fingerprint;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{extract_bearer_token, AuthenticatedUser, JwtVerifier};
use crate::config::AppConfig;
use crate::error::AppError;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    sync: SyncService,
    records: RecordService,
    jwt_verifier: Arc<JwtVerifier>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, db: Database, work_available: Arc<Notify>) -> Self {
        Self {
            sync: SyncService::new(db.clone(), Arc::clone(&work_available)),
            records: RecordService::new(db, work_available),
            jwt_verifier: Arc::new(JwtVerifier::new(&config.jwt_secret, config.auth_clock_skew)),
            config,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/auth/me", get(me))
        .route("/sync", post(sync))
        .route("/patients", post(create_patient).get(list_patients))
        .route("/patients/{id}", get(get_patient))
        .route(
            "/patients/{id}/vitals",
            post(add_vitals).get(list_vitals),
        )
        .route("/cases", post(create_case).get(list_cases))
        .route("/cases/pending", get(pending_cases))
        .route("/cases/{id}", get(get_case))
        .route("/cases/{id}/analysis", get(case_analysis))
        .route("/cases/{id}/conflicts", get(case_conflicts))
        .route("/cases/{id}/diagnosis", post(record_diagnosis))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api", protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    queue: QueueStats,
}

async fn healthz(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    Ok(Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        queue: state.records.queue_stats().await?,
    }))
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())?;
    let user = state.jwt_verifier.verify_access_token(token)?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

#[derive(Debug, Serialize)]
struct MeResponse {
    id: String,
    role: Role,
    stats: CallerStats,
}

async fn me(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<MeResponse>, AppError> {
    let stats = state.records.caller_stats(user.caller()).await?;
    Ok(Json(MeResponse {
        id: user.user_id,
        role: user.role,
        stats,
    }))
}

fn wire_records<E: SyncEntity>(records: &[StoredRecord<E>]) -> Result<Vec<Value>, AppError> {
    Ok(records
        .iter()
        .map(wire_record)
        .collect::<fieldsync_core::Result<Vec<_>>>()?)
}

/// Decode a JSON body, reporting every shape problem as a 400.
fn parse_body<T: DeserializeOwned>(body: Result<Json<Value>, JsonRejection>) -> Result<T, AppError> {
    let Json(value) = body.map_err(|rejection| AppError::bad_request(rejection.body_text()))?;
    serde_json::from_value(value).map_err(|error| AppError::bad_request(error.to_string()))
}

async fn sync(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<SyncResponse>, AppError> {
    let Json(value) = body.map_err(|rejection| AppError::bad_request(rejection.body_text()))?;
    let request = SyncRequest::from_json(value)?;
    let response = state.sync.reconcile(request, &user.user_id).await?;
    Ok(Json(response))
}

async fn create_patient(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let input: NewPatient = parse_body(body)?;
    let patient = state.records.create_patient(user.caller(), input).await?;
    tracing::info!(
        endpoint = "create_patient",
        user = user_fingerprint(&user.user_id),
        patient_id = %patient.record.id,
        "Registered patient"
    );
    Ok((StatusCode::CREATED, Json(wire_record(&patient)?)))
}

async fn list_patients(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<Vec<Value>>, AppError> {
    let patients = state.records.list_patients(user.caller()).await?;
    Ok(Json(wire_records(&patients)?))
}

async fn get_patient(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(patient_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let detail = state.records.get_patient(user.caller(), &patient_id).await?;
    let mut body = wire_record(&detail.patient)?;
    if let Value::Object(map) = &mut body {
        map.insert("vitals".to_string(), Value::Array(wire_records(&detail.vitals)?));
        map.insert("cases".to_string(), Value::Array(wire_records(&detail.cases)?));
    }
    Ok(Json(body))
}

async fn create_case(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let input: NewCase = parse_body(body)?;
    let case = state.records.create_case(user.caller(), input).await?;
    Ok((StatusCode::CREATED, Json(wire_record(&case)?)))
}

async fn list_cases(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<Vec<Value>>, AppError> {
    let cases = state.records.list_cases(user.caller()).await?;
    Ok(Json(wire_records(&cases)?))
}

async fn pending_cases(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<Vec<Value>>, AppError> {
    let cases = state.records.pending_cases(user.caller()).await?;
    Ok(Json(wire_records(&cases)?))
}

async fn get_case(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(case_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let case = state.records.get_case(user.caller(), &case_id).await?;
    Ok(Json(wire_record(&case)?))
}

async fn case_analysis(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(case_id): Path<String>,
) -> Result<Json<QueueEntryView>, AppError> {
    Ok(Json(state.records.case_analysis(user.caller(), &case_id).await?))
}

async fn case_conflicts(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(case_id): Path<String>,
) -> Result<Json<Vec<SyncConflict>>, AppError> {
    Ok(Json(state.records.case_conflicts(user.caller(), &case_id).await?))
}

async fn record_diagnosis(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(case_id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let input: NewDiagnosis = parse_body(body)?;
    let diagnosis = state
        .records
        .record_diagnosis(user.caller(), &case_id, input)
        .await?;
    Ok((StatusCode::CREATED, Json(wire_record(&diagnosis)?)))
}

async fn add_vitals(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(patient_id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let input: NewVitals = parse_body(body)?;
    let vitals = state
        .records
        .add_vitals(user.caller(), &patient_id, input)
        .await?;
    Ok((StatusCode::CREATED, Json(wire_record(&vitals)?)))
}

async fn list_vitals(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(patient_id): Path<String>,
) -> Result<Json<Vec<Value>>, AppError> {
    let readings = state.records.list_vitals(user.caller(), &patient_id).await?;
    Ok(Json(wire_records(&readings)?))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{header, Method};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::auth::tests::{token_with_role, TEST_SECRET};
    use fieldsync_core::services::Caller;

    const CHW_1: Caller<'static> = Caller::chw("chw-1");
    const CHW_2: Caller<'static> = Caller::chw("chw-2");
    const DOCTOR: Caller<'static> = Caller::doctor("doctor-1");

    fn router() -> Router {
        let config = AppConfig::from_lookup(|name| {
            (name == "FIELDSYNC_JWT_SECRET").then(|| TEST_SECRET.to_string())
        })
        .unwrap();
        let db = Database::open_in_memory().unwrap();
        app_router(AppState::new(Arc::new(config), db, Arc::new(Notify::new())))
    }

    async fn call(
        router: &Router,
        method: Method,
        uri: &str,
        user: Option<Caller<'_>>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            let token = token_with_role(user.id, user.role);
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_healthz_reports_queue_counts() {
        let router = router();
        let (status, body) = call(&router, Method::GET, "/healthz", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("ok"));
        assert_eq!(
            body["queue"],
            json!({"queued": 0, "processing": 0, "completed": 0, "failed": 0})
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_api_requires_bearer_token() {
        let router = router();
        let (status, body) = call(&router, Method::POST, "/api/sync", None, Some(json!({}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].as_str().unwrap().contains("Authorization"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sync_round_trip_queues_high_risk_case() {
        let router = router();
        let (status, body) = call(
            &router,
            Method::POST,
            "/api/sync",
            Some(CHW_1),
            Some(json!({
                "last_sync_timestamp": null,
                "changes": {
                    "patients": [{
                        "id": "p1",
                        "demographics": {"age": 34},
                        "last_modified_at": "2024-01-01T00:00:00Z"
                    }],
                    "cases": [{
                        "id": "c1",
                        "patient_id": "p1",
                        "triage_data": {"fever": true},
                        "risk_level": "high",
                        "last_modified_at": "2024-01-01T00:00:00Z"
                    }]
                }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["new_sync_timestamp"].is_string());
        assert_eq!(body["server_updates"]["cases"][0]["id"], json!("c1"));
        assert_eq!(body["server_updates"]["cases"][0]["chw_id"], json!("chw-1"));
        assert_eq!(body["server_updates"]["patients"][0]["demographics"], json!({"age": 34}));

        let (status, body) = call(&router, Method::GET, "/api/cases/c1/analysis", Some(CHW_1), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("queued"));
        assert_eq!(body["attempts"], json!(0));

        let (_, health) = call(&router, Method::GET, "/healthz", None, None).await;
        assert_eq!(health["queue"]["queued"], json!(1));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sync_rejects_malformed_batch() {
        let router = router();
        let (status, body) = call(
            &router,
            Method::POST,
            "/api/sync",
            Some(CHW_1),
            Some(json!({"changes": {"cases": [{"id": "c1", "risk_level": "high"}]}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("cases[0]"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_case_lifecycle_through_direct_writes() {
        let router = router();
        let (status, patient) = call(
            &router,
            Method::POST,
            "/api/patients",
            Some(CHW_1),
            Some(json!({"demographics": {"name": "A", "age": 51}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(patient["chw_id"], json!("chw-1"));
        let patient_id = patient["id"].as_str().unwrap().to_string();

        let (status, case) = call(
            &router,
            Method::POST,
            "/api/cases",
            Some(CHW_1),
            Some(json!({"patient_id": patient_id, "risk_level": "high", "triage_data": {"cough": true}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(case["status"], json!("AWAITING_ANALYSIS"));
        let case_id = case["id"].as_str().unwrap().to_string();

        let (status, _) = call(&router, Method::GET, &format!("/api/cases/{case_id}"), Some(CHW_2), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, diagnosis) = call(
            &router,
            Method::POST,
            &format!("/api/cases/{case_id}/diagnosis"),
            Some(DOCTOR),
            Some(json!({"diagnosis_text": "Bronchitis", "prescription": {"drug": "rest"}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(diagnosis["doctor_id"], json!("doctor-1"));
        assert_eq!(diagnosis["prescription"], json!({"drug": "rest"}));

        let (status, case) = call(&router, Method::GET, &format!("/api/cases/{case_id}"), Some(CHW_1), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(case["status"], json!("DIAGNOSED"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_case_for_foreign_patient_is_not_found() {
        let router = router();
        let (_, patient) = call(
            &router,
            Method::POST,
            "/api/patients",
            Some(CHW_1),
            Some(json!({"demographics": {"age": 20}})),
        )
        .await;
        let (status, _) = call(
            &router,
            Method::POST,
            "/api/cases",
            Some(CHW_2),
            Some(json!({"patient_id": patient["id"]})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_vitals_create_and_list() {
        let router = router();
        let (_, patient) = call(
            &router,
            Method::POST,
            "/api/patients",
            Some(CHW_1),
            Some(json!({"id": "p9", "demographics": {"age": 60}})),
        )
        .await;
        assert_eq!(patient["id"], json!("p9"));

        for temperature in ["37.1", "38.4"] {
            let (status, _) = call(
                &router,
                Method::POST,
                "/api/patients/p9/vitals",
                Some(CHW_1),
                Some(json!({"temperature": temperature, "blood_pressure": "120/80", "weight": "70"})),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, readings) = call(&router, Method::GET, "/api/patients/p9/vitals", Some(CHW_1), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(readings.as_array().unwrap().len(), 2);

        let (status, _) = call(&router, Method::GET, "/api/patients/p9/vitals", Some(CHW_2), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &router,
            Method::POST,
            "/api/patients/p9/vitals",
            Some(CHW_1),
            Some(json!({"temperature": "37"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    async fn seed_case(router: &Router, risk: &str) -> (String, String) {
        let (_, patient) = call(
            router,
            Method::POST,
            "/api/patients",
            Some(CHW_1),
            Some(json!({"demographics": {"age": 44}})),
        )
        .await;
        let patient_id = patient["id"].as_str().unwrap().to_string();
        let (_, case) = call(
            router,
            Method::POST,
            "/api/cases",
            Some(CHW_1),
            Some(json!({"patient_id": patient_id, "risk_level": risk})),
        )
        .await;
        (patient_id, case["id"].as_str().unwrap().to_string())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_diagnosis_is_reserved_for_doctors() {
        let router = router();
        let (_, case_id) = seed_case(&router, "high").await;
        let uri = format!("/api/cases/{case_id}/diagnosis");

        let (status, body) = call(
            &router,
            Method::POST,
            &uri,
            Some(CHW_1),
            Some(json!({"diagnosis_text": "Self-diagnosed"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body["error"].as_str().unwrap().contains("doctor"));

        let (status, case) = call(&router, Method::GET, &format!("/api/cases/{case_id}"), Some(CHW_1), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(case["status"], json!("AWAITING_ANALYSIS"));

        let (status, _) = call(
            &router,
            Method::POST,
            "/api/patients",
            Some(DOCTOR),
            Some(json!({"demographics": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_doctor_reads_patients_and_pending_cases() {
        let router = router();
        let (patient_id, case_id) = seed_case(&router, "high").await;
        call(
            &router,
            Method::POST,
            &format!("/api/patients/{patient_id}/vitals"),
            Some(CHW_1),
            Some(json!({"temperature": "39.0", "blood_pressure": "110/70", "weight": "58"})),
        )
        .await;

        let (status, case) = call(&router, Method::GET, &format!("/api/cases/{case_id}"), Some(DOCTOR), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(case["chw_id"], json!("chw-1"));

        let (status, pending) = call(&router, Method::GET, "/api/cases/pending", Some(DOCTOR), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pending[0]["id"], json!(case_id));
        assert_eq!(pending.as_array().unwrap().len(), 1);

        let (status, _) = call(&router, Method::GET, "/api/cases/pending", Some(CHW_1), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, patient) = call(&router, Method::GET, &format!("/api/patients/{patient_id}"), Some(DOCTOR), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(patient["demographics"], json!({"age": 44}));
        assert_eq!(patient["vitals"][0]["temperature"], json!("39.0"));
        assert_eq!(patient["cases"][0]["id"], json!(case_id));

        let (status, _) = call(&router, Method::GET, &format!("/api/patients/{patient_id}"), Some(CHW_2), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_listings_and_profile_follow_the_caller() {
        let router = router();
        seed_case(&router, "high").await;

        let (status, patients) = call(&router, Method::GET, "/api/patients", Some(CHW_1), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(patients.as_array().unwrap().len(), 1);
        let (_, cases) = call(&router, Method::GET, "/api/cases", Some(CHW_1), None).await;
        assert_eq!(cases.as_array().unwrap().len(), 1);
        let (_, cases) = call(&router, Method::GET, "/api/cases", Some(CHW_2), None).await;
        assert_eq!(cases, json!([]));
        let (status, _) = call(&router, Method::GET, "/api/cases", Some(DOCTOR), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, me) = call(&router, Method::GET, "/api/auth/me", Some(CHW_1), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            me,
            json!({"id": "chw-1", "role": "chw", "stats": {"patients": 1, "cases": 1, "this_week": 1}})
        );

        let (_, me) = call(&router, Method::GET, "/api/auth/me", Some(DOCTOR), None).await;
        assert_eq!(
            me,
            json!({"id": "doctor-1", "role": "doctor", "stats": {"diagnoses": 0, "pending_cases": 1, "this_week": 0}})
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stale_sync_edit_is_listed_as_conflict() {
        let router = router();
        let case = |at: &str| {
            json!({"changes": {"cases": [{
                "id": "c1",
                "patient_id": "p1",
                "triage_data": {"fever": true},
                "risk_level": "low",
                "last_modified_at": at
            }]}})
        };
        for at in ["2024-01-02T00:00:00Z", "2024-01-01T00:00:00Z"] {
            let (status, _) = call(&router, Method::POST, "/api/sync", Some(CHW_1), Some(case(at))).await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, conflicts) = call(&router, Method::GET, "/api/cases/c1/conflicts", Some(CHW_1), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(conflicts.as_array().unwrap().len(), 1);
        assert_eq!(conflicts[0]["submitted_by"], json!("chw-1"));
        assert_eq!(conflicts[0]["incoming_modified_at"], json!("2024-01-01T00:00:00Z"));
    }
}
