use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, StatusCode};
use axum::response::Response;

use crate::api::middleware::AppError;
use crate::api::routes::AppState;

/// Version-explicit asset reference: permanent redirect to the store URL.
pub async fn asset_versioned(
    State(state): State<AppState>,
    Path((dataset, version, asset)): Path<(String, String, String)>,
) -> Result<Response, AppError> {
    let record = state
        .catalog
        .lookup(&dataset, Some(&version))
        .await?
        .ok_or_else(|| AppError::NotFound(format!("{dataset}/{version} does not exist")))?;
    let url = state.assets.url_for(&record.name, &record.version, &asset);
    redirect(StatusCode::MOVED_PERMANENTLY, &url)
}

/// Version-less asset reference: resolve the version, then redirect to the
/// fully qualified asset URL.
pub async fn asset_versionless(
    State(state): State<AppState>,
    Path((dataset, asset)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> Result<Response, AppError> {
    let record = state
        .catalog
        .lookup(&dataset, None)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("dataset {dataset} does not exist")))?;
    let mut location = format!("/{dataset}/{}/assets/{asset}", record.version);
    if let Some(query) = query {
        location.push('?');
        location.push_str(&query);
    }
    redirect(StatusCode::FOUND, &location)
}

pub fn redirect(status: StatusCode, location: &str) -> Result<Response, AppError> {
    Response::builder()
        .status(status)
        .header(header::LOCATION, location)
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .body(Body::empty())
        .map_err(|e| AppError::Internal(e.to_string()))
}
