use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::api::middleware::AppError;
use crate::api::routes::AppState;

/// List every `(name, version)` pair, oldest import first per dataset.
pub async fn list_datasets(State(state): State<AppState>) -> Result<Response, AppError> {
    let mut entries = state.catalog.list(None).await?;
    entries.sort_by(|a, b| a.name.cmp(&b.name).then(a.imported.cmp(&b.imported)));

    Ok((
        [(header::CACHE_CONTROL, "no-cache")],
        Json(entries),
    )
        .into_response())
}
