use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;

use crate::api::admission::AdmissionControl;
use crate::api::handlers::{assets, list, query};
use crate::config::Config;
use crate::services::assets::AssetStore;
use crate::services::catalog::Catalog;
use crate::storage::MySqlStorage;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub storage: MySqlStorage,
    pub catalog: Catalog,
    pub assets: Arc<dyn AssetStore>,
    pub admission: Arc<AdmissionControl>,
    pub config: Config,
}

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/", get(list::list_datasets))
        .route("/health", get(health_check))
        .route("/ddf-service-directory", get(service_directory));

    // Load-test verification token, when configured
    if let Some(token) = state.config.loader_io_token.clone() {
        let body = token.clone();
        router = router.route(
            &format!("/{token}.txt"),
            get(move || {
                let body = body.clone();
                async move { body }
            }),
        );
    }

    router
        .route("/{dataset}", get(query::query_versionless))
        .route("/{dataset}/{version}", get(query::query_versioned))
        .route("/{dataset}/assets/{asset}", get(assets::asset_versionless))
        .route(
            "/{dataset}/{version}/assets/{asset}",
            get(assets::asset_versioned),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admission_guard,
        ))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Load shedding before any routing work happens.
async fn admission_guard(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Err(rejected) = state
        .admission
        .check(state.storage.queued_queries())
    {
        return rejected.into_response();
    }
    next.run(request).await
}

/// Static description of the service's URL templates.
async fn service_directory() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "list": "/",
        "query": "/DATASET/VERSION",
        "assets": "DATASET/VERSION/assets/ASSET"
    }))
}

async fn health_check() -> &'static str {
    "OK"
}
