// sf-server lib.rs
// HTTP decision API for the send-timing intelligence layer.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use axum::{
    extract::{Path as UrlPath, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use sf_core::{
    AppliedWeight, ErrorReport, FeatureSummary, Identifier, IdentifierType, RawIdentifiers,
    TimingConfig, TimingDecision, TimingError, UniversalId,
};
use sf_store::{
    EventStore, ExplanationLog, MemoryEventLog, SqliteEventStore, SqliteExplanationLog,
    SqliteFeatureCache, SqliteIdentityStore,
};
use sf_timingd::{
    DecisionEngine, DecisionRequest, FeatureEngine, IdentityResolver, IngestPipeline,
    IngestStatsSnapshot,
};

pub mod ingest_source;

// ============================================================================
// Application State
// ============================================================================

pub struct AppState {
    pub config: Arc<TimingConfig>,
    pub events: Arc<SqliteEventStore>,
    pub resolver: Arc<IdentityResolver>,
    pub features: Arc<FeatureEngine>,
    pub decisions: Arc<DecisionEngine>,
    pub explanations: Arc<dyn ExplanationLog>,
    pub pipeline: Arc<IngestPipeline>,
    pub event_log: Arc<MemoryEventLog>,
    pub started_at: DateTime<Utc>,
}

pub type SharedState = Arc<AppState>;

/// Partition count for the in-process event log; adapters keyed by
/// recipient land on a stable partition.
const LOG_PARTITIONS: u32 = 4;

impl AppState {
    /// Everything backed by on-disk SQLite under `data_dir`.
    pub fn open(data_dir: &Path, config: TimingConfig) -> sf_core::Result<SharedState> {
        std::fs::create_dir_all(data_dir).map_err(|e| {
            TimingError::BackendUnavailable(format!("create data dir: {}", e))
        })?;
        let events = Arc::new(SqliteEventStore::open(&data_dir.join("events.db"))?);
        let identity = Arc::new(SqliteIdentityStore::open(&data_dir.join("identity.db"))?);
        let cache = Arc::new(SqliteFeatureCache::open(&data_dir.join("features.db"))?);
        let explanations = Arc::new(SqliteExplanationLog::open(&data_dir.join("explanations.db"))?);
        let dlq = Arc::new(sf_store::JsonlDeadLetterSink::new(data_dir));
        Ok(Self::assemble(events, identity, cache, explanations, dlq, config))
    }

    /// Fully in-memory state for tests.
    pub fn open_in_memory(config: TimingConfig) -> sf_core::Result<SharedState> {
        let events = Arc::new(SqliteEventStore::open_in_memory()?);
        let identity = Arc::new(SqliteIdentityStore::open_in_memory()?);
        let cache = Arc::new(SqliteFeatureCache::open_in_memory()?);
        let explanations = Arc::new(SqliteExplanationLog::open_in_memory()?);
        let dlq = Arc::new(sf_store::MemoryDeadLetterSink::new());
        Ok(Self::assemble(events, identity, cache, explanations, dlq, config))
    }

    fn assemble(
        events: Arc<SqliteEventStore>,
        identity: Arc<SqliteIdentityStore>,
        cache: Arc<SqliteFeatureCache>,
        explanations: Arc<SqliteExplanationLog>,
        dlq: Arc<dyn sf_store::DeadLetterSink>,
        config: TimingConfig,
    ) -> SharedState {
        let config = Arc::new(config);
        let resolver = Arc::new(IdentityResolver::new(identity, config.clone()));
        let features = Arc::new(FeatureEngine::new(
            events.clone(),
            cache,
            config.clone(),
        ));
        let decisions = Arc::new(DecisionEngine::new(
            resolver.clone(),
            features.clone(),
            events.clone(),
            explanations.clone(),
            config.clone(),
        ));
        let pipeline = Arc::new(IngestPipeline::new(
            resolver.clone(),
            events.clone(),
            dlq,
            config.clone(),
        ));
        Arc::new(AppState {
            config,
            events,
            resolver,
            features,
            decisions,
            explanations,
            pipeline,
            event_log: Arc::new(MemoryEventLog::new(LOG_PARTITIONS)),
            started_at: Utc::now(),
        })
    }
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct TimingDecisionHttpRequest {
    pub universal_id: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub klaviyo_id: Option<String>,
    pub shopify_customer_id: Option<String>,
    pub esp_user_id: Option<String>,
    pub ip_device_signature: Option<String>,
    pub provider: Option<String>,
    pub campaign_type: Option<String>,
    pub payload_size_bytes: Option<u64>,
    pub queue_depth_estimate: Option<u64>,
    pub send_after: Option<DateTime<Utc>>,
    pub send_before: Option<DateTime<Utc>>,
    pub latency_estimate_seconds: Option<f64>,
}

impl TimingDecisionHttpRequest {
    fn identifiers(&self) -> RawIdentifiers {
        RawIdentifiers {
            email: self.email.clone(),
            phone: self.phone.clone(),
            klaviyo_id: self.klaviyo_id.clone(),
            shopify_customer_id: self.shopify_customer_id.clone(),
            esp_user_id: self.esp_user_id.clone(),
            ip_device_signature: self.ip_device_signature.clone(),
        }
    }

    fn into_decision_request(self) -> DecisionRequest {
        let identifiers = self.identifiers();
        DecisionRequest {
            universal_id: self.universal_id.map(UniversalId::new),
            identifiers,
            send_after: self.send_after,
            send_before: self.send_before,
            latency_estimate_seconds: self.latency_estimate_seconds,
            esp: self.provider,
            campaign_type: self.campaign_type,
            payload_size_bytes: self.payload_size_bytes,
            queue_depth_estimate: self.queue_depth_estimate,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DecisionDebug {
    pub applied_weights: Vec<AppliedWeight>,
    pub base_curve_peak_minute: u16,
    pub suppressed: bool,
}

#[derive(Debug, Serialize)]
pub struct TimingDecisionHttpResponse {
    pub decision_id: String,
    pub universal_id: String,
    pub target_minute: u16,
    pub trigger_timestamp_utc: DateTime<Utc>,
    pub latency_estimate_seconds: f64,
    pub confidence_score: f64,
    pub model_version: String,
    pub explanation_ref: String,
    pub suppressed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppression_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppression_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub created_at_utc: DateTime<Utc>,
    pub debug: DecisionDebug,
}

impl From<TimingDecision> for TimingDecisionHttpResponse {
    fn from(decision: TimingDecision) -> Self {
        Self {
            debug: DecisionDebug {
                applied_weights: decision.applied_weights.clone(),
                base_curve_peak_minute: decision.base_curve_peak_minute,
                suppressed: decision.suppressed,
            },
            decision_id: decision.decision_id,
            universal_id: decision.universal_id.as_str().to_string(),
            target_minute: decision.target_minute,
            trigger_timestamp_utc: decision.trigger_timestamp_utc,
            latency_estimate_seconds: decision.latency_estimate_seconds,
            confidence_score: decision.confidence_score,
            model_version: decision.model_version,
            explanation_ref: decision.explanation_ref,
            suppressed: decision.suppressed,
            suppression_reason: decision.suppression_reason,
            suppression_until: decision.suppression_until,
            warnings: decision.warnings,
            created_at_utc: decision.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ResolveHttpRequest {
    #[serde(flatten)]
    pub identifiers: RawIdentifiers,
}

#[derive(Debug, Serialize)]
pub struct ResolveHttpResponse {
    pub universal_id: String,
    pub confidence: f64,
    pub resolution_id: String,
    pub steps: Vec<String>,
    pub identifiers: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct LinkHttpRequest {
    pub identifier_a: String,
    pub type_a: String,
    pub identifier_b: String,
    pub type_b: String,
    pub weight: Option<f64>,
    pub source: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ComputeFeaturesRequest {
    pub min_events: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: i64,
    pub store_ok: bool,
    pub ingest: IngestStatsSnapshot,
}

// ============================================================================
// Error mapping
// ============================================================================

pub struct ApiError(pub TimingError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TimingError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            TimingError::IdentityUnresolved => StatusCode::UNPROCESSABLE_ENTITY,
            TimingError::WindowExpired(_) => StatusCode::UNPROCESSABLE_ENTITY,
            TimingError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            TimingError::CurveUnavailable(_)
            | TimingError::PredictorUnavailable(_)
            | TimingError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(ErrorReport::from(&self.0))).into_response()
    }
}

impl From<TimingError> for ApiError {
    fn from(err: TimingError) -> Self {
        Self(err)
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn post_timing_decision(
    State(state): State<SharedState>,
    Json(request): Json<TimingDecisionHttpRequest>,
) -> Result<Json<TimingDecisionHttpResponse>, ApiError> {
    let decision = state.decisions.decide(&request.into_decision_request())?;
    Ok(Json(decision.into()))
}

async fn get_features(
    State(state): State<SharedState>,
    UrlPath(universal_id): UrlPath<String>,
) -> Result<Json<FeatureSummary>, ApiError> {
    let snapshot = state.features.features(&UniversalId::new(universal_id))?;
    Ok(Json(FeatureSummary::from(&snapshot)))
}

async fn post_compute_features(
    State(state): State<SharedState>,
    Json(request): Json<ComputeFeaturesRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let computed = state
        .features
        .compute_all_at(request.min_events.unwrap_or(3), Utc::now())?;
    Ok(Json(serde_json::json!({ "computed": computed })))
}

async fn post_identity_resolve(
    State(state): State<SharedState>,
    Json(request): Json<ResolveHttpRequest>,
) -> Result<Json<ResolveHttpResponse>, ApiError> {
    let outcome = state.resolver.resolve(&request.identifiers)?;
    let identifiers = outcome
        .known_identifiers
        .iter()
        .map(|entry| {
            (
                entry.identifier.id_type.as_str().to_string(),
                entry.identifier.value.clone(),
            )
        })
        .collect();
    Ok(Json(ResolveHttpResponse {
        universal_id: outcome.universal_id.as_str().to_string(),
        confidence: outcome.confidence,
        resolution_id: outcome.resolution_id,
        steps: outcome.steps,
        identifiers,
    }))
}

async fn post_identity_link(
    State(state): State<SharedState>,
    Json(request): Json<LinkHttpRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let type_a = IdentifierType::parse(&request.type_a).ok_or_else(|| {
        TimingError::InvalidInput(format!("unknown identifier type: {}", request.type_a))
    })?;
    let type_b = IdentifierType::parse(&request.type_b).ok_or_else(|| {
        TimingError::InvalidInput(format!("unknown identifier type: {}", request.type_b))
    })?;
    state.resolver.link_edge(
        Identifier::new(type_a, request.identifier_a),
        Identifier::new(type_b, request.identifier_b),
        request.weight,
        request.source.as_deref().unwrap_or("api"),
    )?;
    Ok(Json(serde_json::json!({ "status": "linked" })))
}

async fn get_explanation(
    State(state): State<SharedState>,
    UrlPath(explanation_ref): UrlPath<String>,
) -> Result<Response, ApiError> {
    match state.explanations.by_ref(&explanation_ref)? {
        Some(explanation) => Ok(Json(explanation).into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(ErrorReport {
                code: "not_found".to_string(),
                message: format!("no explanation for {}", explanation_ref),
            }),
        )
            .into_response()),
    }
}

async fn get_health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let store_ok = state
        .events
        .active_universal_ids(1, Utc::now() - chrono::Duration::days(1))
        .is_ok();
    Json(HealthResponse {
        status: if store_ok { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
        store_ok,
        ingest: state.pipeline.stats(),
    })
}

// ============================================================================
// Router
// ============================================================================

pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/timing-decision", post(post_timing_decision))
        .route("/api/features/:universal_id", get(get_features))
        .route("/api/compute-features", post(post_compute_features))
        .route("/api/identity/resolve", post(post_identity_resolve))
        .route("/api/identity/link", post(post_identity_link))
        .route("/api/explanations/:explanation_ref", get(get_explanation))
        .route("/api/ingest", post(ingest_source::post_ingest))
        .route("/api/health", get(get_health))
        .layer(cors)
        .with_state(state)
}
