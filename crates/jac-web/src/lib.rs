//! JSON HTTP surface for reviewing consolidated auctions and arbitrating conflicts.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use jac_core::{FieldConfidence, FieldValue, TrackedField};
use jac_storage::ConsolidatedStore;
use jac_sync::{
    open_store, report_runs_markdown, ConflictLedger, ConsolidationConfig, ConsolidationStats,
    LedgerError, Resolution,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jac-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ConsolidatedStore>,
    pub ledger: Arc<ConflictLedger>,
    pub reports_root: PathBuf,
}

impl AppState {
    pub fn new(
        store: Arc<dyn ConsolidatedStore>,
        total_fields: usize,
        reports_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ledger: Arc::new(ConflictLedger::new(store.clone(), total_fields)),
            store,
            reports_root: reports_root.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RecordRow {
    pub id: Uuid,
    pub matching_key: String,
    pub sale_date: Option<NaiveDate>,
    pub court: Option<String>,
    pub city: Option<String>,
    pub sources: Vec<String>,
    pub confidence_score: f64,
    pub pending_validation: Vec<TrackedField>,
}

#[derive(Debug, Serialize)]
struct FieldComparison {
    field: TrackedField,
    confidence: FieldConfidence,
    current: Option<FieldValue>,
    values: BTreeMap<String, Option<FieldValue>>,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    value: serde_json::Value,
    source: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unprocessable(String),
    Internal(anyhow::Error),
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::UnknownRecord(_) => Self::NotFound(err.to_string()),
            LedgerError::NoSuchConflict { .. } | LedgerError::Contended(_) => {
                Self::Conflict(err.to_string())
            }
            LedgerError::UnknownSource { .. } | LedgerError::Coercion(_) => {
                Self::Unprocessable(err.to_string())
            }
            LedgerError::Store(inner) => Self::Internal(inner.into()),
        }
    }
}

impl From<jac_storage::StoreError> for ApiError {
    fn from(err: jac_storage::StoreError) -> Self {
        Self::Internal(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::Conflict(m) => (StatusCode::CONFLICT, m),
            Self::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m),
            Self::Internal(err) => {
                tracing::warn!(error = %format!("{err:#}"), "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("server error: {err}"))
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/records", get(records_handler))
        .route("/records/pending", get(pending_handler))
        .route("/records/{id}", get(record_handler))
        .route("/records/{id}/conflicts", get(conflicts_handler))
        .route(
            "/records/{id}/fields/{field}/comparison",
            get(comparison_handler),
        )
        .route("/records/{id}/fields/{field}/resolve", post(resolve_handler))
        .route("/stats", get(stats_handler))
        .route("/reports", get(reports_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(bind: &str, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    tracing::info!(%bind, "jac-web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = ConsolidationConfig::from_env();
    let store = open_store(&config.store).await?;
    let schema = jac_sync::load_field_schema(&config.schema_path()).await?;
    let state = AppState::new(store, schema.len(), config.reports_root());
    serve(&config.bind, state).await
}

fn parse_field(name: &str) -> Result<TrackedField, ApiError> {
    name.parse::<TrackedField>()
        .map_err(|err| ApiError::BadRequest(err.to_string()))
}

fn row(record: &jac_core::ConsolidatedRecord) -> RecordRow {
    RecordRow {
        id: record.id,
        matching_key: record.matching_key.to_string(),
        sale_date: record.sale_date,
        court: record.court.clone(),
        city: record.city.clone(),
        sources: record.sources.clone(),
        confidence_score: record.confidence_score,
        pending_validation: record.pending_validation.clone(),
    }
}

/// Accepts bare JSON scalars as well as the tagged `{kind, value}` form.
fn field_value_from_json(value: serde_json::Value) -> Option<FieldValue> {
    match value {
        serde_json::Value::String(s) => Some(FieldValue::Text(s)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Some(FieldValue::Integer(i)),
            None => n.as_f64().map(FieldValue::Number),
        },
        tagged @ serde_json::Value::Object(_) => serde_json::from_value(tagged).ok(),
        _ => None,
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "service": CRATE_NAME }))
}

async fn records_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<RecordRow>>, ApiError> {
    let records = state
        .store
        .list_all(query.limit.unwrap_or(50), query.offset.unwrap_or(0))
        .await?;
    Ok(Json(records.iter().map(row).collect()))
}

async fn pending_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<RecordRow>>, ApiError> {
    let records = state.store.list_pending_conflicts().await?;
    Ok(Json(records.iter().map(row).collect()))
}

async fn record_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<Response, ApiError> {
    match state.store.get_by_id(id).await? {
        Some(record) => Ok(Json(record).into_response()),
        None => Err(ApiError::NotFound(format!("unknown record {id}"))),
    }
}

async fn conflicts_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<Response, ApiError> {
    let conflicts = state.ledger.get_unresolved_conflicts(id).await?;
    Ok(Json(conflicts).into_response())
}

async fn comparison_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((id, field)): AxumPath<(Uuid, String)>,
) -> Result<Response, ApiError> {
    let field = parse_field(&field)?;
    let record = state
        .store
        .get_by_id(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unknown record {id}")))?;
    Ok(Json(FieldComparison {
        field,
        confidence: record.field_confidence(field),
        current: record.tracked_value(field),
        values: record.field_comparison(field),
    })
    .into_response())
}

async fn resolve_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((id, field)): AxumPath<(Uuid, String)>,
    Json(body): Json<ResolveRequest>,
) -> Result<Response, ApiError> {
    let field = parse_field(&field)?;
    let chosen_value = field_value_from_json(body.value).ok_or_else(|| {
        ApiError::Unprocessable("value must be a string, number or tagged value".into())
    })?;
    let record = state
        .ledger
        .resolve(
            id,
            Resolution {
                field,
                chosen_value,
                chosen_source: body.source,
                reason: body.reason,
            },
            Utc::now(),
        )
        .await?;
    Ok(Json(record).into_response())
}

async fn stats_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ConsolidationStats>, ApiError> {
    let records = state.store.list_all(usize::MAX, 0).await?;
    Ok(Json(ConsolidationStats::from_records(&records)))
}

async fn reports_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    if !state.reports_root.exists() {
        return Err(ApiError::NotFound("no consolidation runs yet".into()));
    }
    let markdown = report_runs_markdown(10, &state.reports_root).map_err(ApiError::Internal)?;
    Ok((
        [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
        markdown,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::TimeZone;
    use http_body_util::BodyExt;
    use jac_core::{FieldSchema, MatchingKey, RawRecord};
    use jac_storage::MemoryStore;
    use jac_sync::{Consolidator, SourceOrder};
    use tower::ServiceExt;

    async fn seeded() -> (Router, Uuid) {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap();
        let group = [("vench", 50.0), ("licitor", 45.0)]
            .into_iter()
            .map(|(source, surface)| RawRecord {
                source: source.into(),
                url: format!("https://{source}.example/lot"),
                sale_date: NaiveDate::from_ymd_opt(2026, 4, 9),
                court: Some("Tribunal Judiciaire de Marseille".into()),
                city: Some("Marseille".into()),
                surface: Some(surface),
                ..Default::default()
            })
            .collect::<Vec<_>>();
        let record = Consolidator::new(FieldSchema::v1(), SourceOrder::default()).merge_group(
            &MatchingKey::new("9f1c0d7e4b2a6c3d"),
            &group,
            None,
            at,
        );
        let store = Arc::new(MemoryStore::new());
        let id = store.upsert_consolidated(&record).await.unwrap();
        let state = AppState::new(store, TrackedField::ALL.len(), "/nonexistent/reports");
        (app(state), id)
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn resolve(id: Uuid, field: &str, body: serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(format!("/records/{id}/fields/{field}/resolve"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn pending_list_and_comparison() {
        let (app, id) = seeded().await;

        let health = app.clone().oneshot(get("/healthz")).await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let pending = app.clone().oneshot(get("/records/pending")).await.unwrap();
        assert_eq!(pending.status(), StatusCode::OK);
        let rows = json(pending).await;
        assert_eq!(rows.as_array().map(Vec::len), Some(1));
        assert_eq!(rows[0]["pending_validation"][0], "surface");

        let comparison = app
            .clone()
            .oneshot(get(&format!("/records/{id}/fields/surface/comparison")))
            .await
            .unwrap();
        assert_eq!(comparison.status(), StatusCode::OK);
        let body = json(comparison).await;
        assert_eq!(body["confidence"], "conflict");
        assert_eq!(body["values"]["licitor"]["value"], 45.0);

        let city = app
            .clone()
            .oneshot(get(&format!("/records/{id}/fields/city/comparison")))
            .await
            .unwrap();
        assert_eq!(json(city).await["confidence"], "high");

        // no source reported a property type
        let property_type = app
            .oneshot(get(&format!("/records/{id}/fields/property_type/comparison")))
            .await
            .unwrap();
        assert_eq!(json(property_type).await["current"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn resolve_then_repeat_is_conflict() {
        let (app, id) = seeded().await;

        let resp = app
            .clone()
            .oneshot(resolve(id, "surface", serde_json::json!({"value": 45, "source": "licitor"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let record = json(resp).await;
        assert_eq!(record["surface"], 45.0);
        assert_eq!(record["pending_validation"].as_array().map(Vec::len), Some(0));

        let again = app
            .clone()
            .oneshot(resolve(id, "surface", serde_json::json!({"value": 50, "source": "vench"})))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::CONFLICT);

        let conflicts = app
            .oneshot(get(&format!("/records/{id}/conflicts")))
            .await
            .unwrap();
        assert_eq!(json(conflicts).await.as_array().map(Vec::len), Some(0));
    }

    #[tokio::test]
    async fn error_statuses() {
        let (app, id) = seeded().await;

        let unknown_field = app
            .clone()
            .oneshot(resolve(
                id,
                "ville",
                serde_json::json!({"value": "x", "source": "vench"}),
            ))
            .await
            .unwrap();
        assert_eq!(unknown_field.status(), StatusCode::BAD_REQUEST);

        let bad_value = app
            .clone()
            .oneshot(resolve(
                id,
                "surface",
                serde_json::json!({"value": "grand", "source": "vench"}),
            ))
            .await
            .unwrap();
        assert_eq!(bad_value.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let missing = app
            .clone()
            .oneshot(get(&format!("/records/{}", Uuid::nil())))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let stats = app.oneshot(get("/stats")).await.unwrap();
        let stats = json(stats).await;
        assert_eq!(stats["total"], 1);
        assert_eq!(stats["with_conflicts"], 1);
    }
}
