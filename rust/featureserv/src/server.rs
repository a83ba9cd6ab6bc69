use crate::{
    config::AppConfig,
    db,
    edits::{ApplyEditsResponse, EditParams},
    error::{Result, ServiceError},
    query::{
        metadata::{LayerInfo, ServiceInfo},
        renderer::Renderer,
        QueryEngine, QueryOutput, QueryParams, RendererParams, TimeQueryResponse,
    },
    registry::Registry,
    state::AppState,
};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

const LAYER_PATH: &str = "/rest/services/:service_id/FeatureServer/:layer";

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

impl Server {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::load(&config.registry_path)?);
        let pool = db::connect_pool(&config).await?;
        let config = Arc::new(config);
        let query = QueryEngine::new(pool, Arc::clone(&config), registry);
        let state = AppState::new(Arc::clone(&config), query);

        Ok(Self { config, state })
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(Self::health))
            .route(
                "/rest/services/:service_id/FeatureServer",
                get(Self::service_info),
            )
            .route(LAYER_PATH, get(Self::layer_info))
            .route(
                &format!("{LAYER_PATH}/query"),
                get(Self::query).post(Self::query_form),
            )
            .route(
                &format!("{LAYER_PATH}/generateRenderer"),
                get(Self::generate_renderer).post(Self::generate_renderer_form),
            )
            .route(&format!("{LAYER_PATH}/applyEdits"), post(Self::apply_edits))
            .route(
                &format!("{LAYER_PATH}/time-query"),
                get(Self::time_query).post(Self::time_query),
            )
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "feature service listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    async fn health() -> Json<serde_json::Value> {
        Json(json!({ "status": "ok" }))
    }

    async fn service_info(
        State(state): State<AppState>,
        Path(service_id): Path<String>,
    ) -> Result<Json<ServiceInfo>> {
        Ok(Json(state.query.service_info(&service_id)?))
    }

    async fn layer_info(
        State(state): State<AppState>,
        Path((service_id, layer)): Path<(String, i32)>,
    ) -> Result<Json<LayerInfo>> {
        Ok(Json(state.query.layer_info(&service_id, layer).await?))
    }

    async fn query(
        State(state): State<AppState>,
        Path((service_id, layer)): Path<(String, i32)>,
        Query(params): Query<QueryParams>,
    ) -> Result<Response> {
        let output = state.query.query(&service_id, layer, &params).await?;
        Ok(query_response(output))
    }

    async fn query_form(
        State(state): State<AppState>,
        Path((service_id, layer)): Path<(String, i32)>,
        Form(params): Form<QueryParams>,
    ) -> Result<Response> {
        let output = state.query.query(&service_id, layer, &params).await?;
        Ok(query_response(output))
    }

    async fn generate_renderer(
        State(state): State<AppState>,
        Path((service_id, layer)): Path<(String, i32)>,
        Query(params): Query<RendererParams>,
    ) -> Result<Json<Renderer>> {
        let renderer = state
            .query
            .generate_renderer(&service_id, layer, &params)
            .await?;
        Ok(Json(renderer))
    }

    async fn generate_renderer_form(
        State(state): State<AppState>,
        Path((service_id, layer)): Path<(String, i32)>,
        Form(params): Form<RendererParams>,
    ) -> Result<Json<Renderer>> {
        let renderer = state
            .query
            .generate_renderer(&service_id, layer, &params)
            .await?;
        Ok(Json(renderer))
    }

    async fn apply_edits(
        State(state): State<AppState>,
        Path((service_id, layer)): Path<(String, i32)>,
        headers: HeaderMap,
        Form(params): Form<EditParams>,
    ) -> Result<Json<ApplyEditsResponse>> {
        enforce_api_key(&headers, &state.config)?;
        let response = state.query.apply_edits(&service_id, layer, params).await?;
        Ok(Json(response))
    }

    async fn time_query(
        State(state): State<AppState>,
        Path((service_id, layer)): Path<(String, i32)>,
    ) -> Result<Json<TimeQueryResponse>> {
        Ok(Json(state.query.time_query(&service_id, layer).await?))
    }
}

fn query_response(output: QueryOutput) -> Response {
    match output {
        QueryOutput::Json(body) => Json(body).into_response(),
        QueryOutput::Csv(text) => (
            [
                (header::CONTENT_TYPE, "text/csv"),
                (header::CONTENT_DISPOSITION, "attachment; filename=\"query.csv\""),
            ],
            text,
        )
            .into_response(),
    }
}

fn enforce_api_key(headers: &HeaderMap, config: &AppConfig) -> Result<()> {
    if let Some(expected) = &config.api_key {
        let provided = headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok());

        if provided != Some(expected.as_str()) {
            return Err(ServiceError::Auth);
        }
    }

    Ok(())
}
