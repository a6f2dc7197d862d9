//! Analysis Routes
//!
//! On-demand analysis, record lookup and the actionable signal feed.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use signal_core::{AnalysisRecord, AnalysisStatus, NewsItem, RecordFilter, SignalProduced};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::stream::stream_routes;
use crate::{ApiError, ApiResponse, AppState};

/// Largest page served by the list endpoints
const MAX_LIMIT: usize = 500;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/analyze", post(analyze))
        .route("/api/analysis", get(list_analyses))
        .route("/api/analysis/:news_id", get(get_analysis))
        .route("/api/analysis/:news_id/reprocess", post(reprocess))
        .route("/api/signals", get(list_signals))
        .merge(stream_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// News item as submitted over HTTP
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewsItemInput {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(alias = "published_at")]
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub tickers: Vec<String>,
}

impl From<NewsItemInput> for NewsItem {
    fn from(input: NewsItemInput) -> Self {
        NewsItem {
            id: input.id.trim().to_string(),
            title: input.title,
            body: input.body,
            source: input.source.unwrap_or_else(|| "api".to_string()),
            published_at: input.published_at,
            tickers: input
                .tickers
                .into_iter()
                .map(|t| t.trim().to_ascii_uppercase())
                .filter(|t| !t.is_empty())
                .collect::<BTreeSet<_>>(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AnalyzeBody {
    Many(Vec<NewsItemInput>),
    One(NewsItemInput),
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SignalQuery {
    pub actionable: Option<bool>,
    pub limit: Option<usize>,
}

fn caller_id(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-caller-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "anonymous".to_string())
}

fn page_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(100).clamp(1, MAX_LIMIT)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Analyse one item or an array of items
async fn analyze(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(body): Json<AnalyzeBody>,
) -> Result<Response, ApiError> {
    let caller = caller_id(&headers, peer.map(|ConnectInfo(addr)| addr));

    match body {
        AnalyzeBody::One(input) => {
            let record = state.gateway.analyze(&caller, input.into()).await?;
            Ok(Json(ApiResponse::success(record)).into_response())
        }
        AnalyzeBody::Many(inputs) => {
            let items = inputs.into_iter().map(NewsItem::from).collect();
            let results = state.gateway.analyze_many(&caller, items).await?;
            Ok(Json(ApiResponse::success(results)).into_response())
        }
    }
}

async fn get_analysis(
    State(state): State<AppState>,
    Path(news_id): Path<String>,
) -> Result<Json<ApiResponse<AnalysisRecord>>, ApiError> {
    let record = state
        .store
        .get(&news_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Analysis {}", news_id)))?;
    Ok(Json(ApiResponse::success(record)))
}

/// List stored analyses, optionally by status (e.g. `?status=error` for reprocessing)
async fn list_analyses(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<Vec<AnalysisRecord>>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(|s| s.parse::<AnalysisStatus>())
        .transpose()
        .map_err(ApiError::BadRequest)?;

    let records = state
        .store
        .list(&RecordFilter {
            status,
            actionable_only: false,
            limit: page_limit(query.limit),
        })
        .await?;
    Ok(Json(ApiResponse::success(records)))
}

/// Completed signals; actionable only unless `?actionable=false`
async fn list_signals(
    State(state): State<AppState>,
    Query(query): Query<SignalQuery>,
) -> Result<Json<ApiResponse<Vec<SignalProduced>>>, ApiError> {
    let records = state
        .store
        .list(&RecordFilter {
            status: Some(AnalysisStatus::Completed),
            actionable_only: query.actionable.unwrap_or(true),
            limit: page_limit(query.limit),
        })
        .await?;

    let signals = records.iter().map(SignalProduced::from_record).collect();
    Ok(Json(ApiResponse::success(signals)))
}

async fn reprocess(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(news_id): Path<String>,
) -> Result<Json<ApiResponse<AnalysisRecord>>, ApiError> {
    let caller = caller_id(&headers, peer.map(|ConnectInfo(addr)| addr));
    let record = state
        .gateway
        .reprocess(&caller, &news_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Analysis {}", news_id)))?;
    Ok(Json(ApiResponse::success(record)))
}
