use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use mysql_async::prelude::*;
use std::convert::Infallible;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::api::handlers::assets::redirect;
use crate::api::middleware::AppError;
use crate::api::routes::AppState;
use crate::api::stream::{row_to_json, ResultFrame};
use crate::models::dataset::DatasetRecord;
use crate::models::query::DdfQuery;
use crate::services::catalog::hash_password;
use crate::services::compiler;

/// Queries slower than this are logged but still streamed.
const SLOW_QUERY: Duration = Duration::from_secs(1);
/// Back-pressure window between the row fetcher and the response body.
const STREAM_BUFFER: usize = 32;

/// Version-less query: resolve the version, then redirect so every cached
/// response is keyed by an explicit version. The query string survives
/// verbatim.
pub async fn query_versionless(
    State(state): State<AppState>,
    Path(dataset): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<Response, AppError> {
    let record = state
        .catalog
        .lookup(&dataset, None)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("dataset {dataset} does not exist")))?;
    let mut location = format!("/{dataset}/{}", record.version);
    if let Some(query) = query {
        location.push('?');
        location.push_str(&query);
    }
    redirect(StatusCode::FOUND, &location)
}

/// Version-explicit query execution.
pub async fn query_versioned(
    State(state): State<AppState>,
    Path((dataset, version)): Path<(String, String)>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Result<Response, AppError> {
    let record = state
        .catalog
        .lookup(&dataset, Some(&version))
        .await?
        .ok_or_else(|| AppError::NotFound(format!("{dataset}/{version} does not exist")))?;
    authorize(&record, &headers)?;

    let raw = query.ok_or_else(|| AppError::QuerySyntax("missing query".to_string()))?;
    let query = DdfQuery::from_query_string(&raw)?;
    let compiled = compiler::compile(&query, &record.schema)?;

    let cacheable = state.config.server.cache_allow && !record.is_protected();
    let mut frame = ResultFrame::new(&record.version, &compiled);

    // Schema queries are answered from the in-memory model
    if let Some(rows) = &compiled.synthetic_rows {
        let mut body = Vec::new();
        body.extend_from_slice(&frame.preamble());
        for row in rows {
            if let Some(chunk) = frame.row(row) {
                body.extend_from_slice(&chunk);
            }
        }
        body.extend_from_slice(&frame.trailer());
        return respond(Body::from(body), cacheable, &record);
    }

    let sql = compiled.sql.clone().unwrap_or_default();
    let conn = state.storage.conn().await?;

    let (tx, rx) = mpsc::channel::<Bytes>(STREAM_BUFFER);
    tokio::spawn(async move {
        let mut conn = conn;
        let started = Instant::now();
        if tx.send(frame.preamble()).await.is_err() {
            return;
        }
        let outcome: Result<(), mysql_async::Error> = async {
            let mut result = conn.query_iter(sql.as_str()).await?;
            if let Some(mut rows) = result.stream::<mysql_async::Row>().await? {
                while let Some(row) = rows.try_next().await? {
                    let Some(chunk) = frame.row(&row_to_json(row)) else {
                        continue;
                    };
                    if tx.send(chunk).await.is_err() {
                        // Client went away; stop fetching
                        return Ok(());
                    }
                }
            }
            Ok(())
        }
        .await;
        match outcome {
            Ok(()) => {
                if started.elapsed() > SLOW_QUERY {
                    tracing::warn!(
                        "slow query ({}ms): {}",
                        started.elapsed().as_millis(),
                        sql
                    );
                }
                let _ = tx.send(frame.trailer()).await;
            }
            Err(e) => {
                // The preamble may already be out; the truncated body tells
                // the client the stream died
                tracing::error!("query failed: {}; sql: {}", e, sql);
            }
        }
        // conn drops here, returning to the pool
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    respond(body, cacheable, &record)
}

fn respond(body: Body, cacheable: bool, record: &DatasetRecord) -> Result<Response, AppError> {
    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json");
    let builder = if cacheable {
        builder
            .header(
                header::CACHE_CONTROL,
                "public, max-age=31536000, immutable",
            )
            .header("Cache-Tag", format!("{}/{}", record.name, record.version))
    } else {
        builder.header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
    };
    builder
        .body(body)
        .map_err(|e| AppError::Internal(e.to_string()))
}

/// HTTP Basic check against the stored SHA-256 password hash.
fn authorize(record: &DatasetRecord, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = &record.password_hash else {
        return Ok(());
    };
    let denied = || AppError::Unauthorized(record.name.clone());

    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(denied)?;
    let encoded = authorization.strip_prefix("Basic ").ok_or_else(denied)?;
    let decoded = B64.decode(encoded.trim()).map_err(|_| denied())?;
    let credentials = String::from_utf8(decoded).map_err(|_| denied())?;
    let password = credentials
        .split_once(':')
        .map_or(credentials.as_str(), |(_, password)| password);

    if hash_password(password) == *expected {
        Ok(())
    } else {
        Err(denied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::schema::SchemaModel;
    use chrono::Utc;

    fn record(password: Option<&str>) -> DatasetRecord {
        DatasetRecord {
            name: "test".into(),
            version: "v1".into(),
            is_default: false,
            imported: Utc::now(),
            password_hash: password.map(hash_password),
            schema: SchemaModel::default(),
        }
    }

    fn basic_auth(user: &str, password: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let token = B64.encode(format!("{user}:{password}"));
        headers.insert(
            header::AUTHORIZATION,
            format!("Basic {token}").parse().unwrap(),
        );
        headers
    }

    #[test]
    fn test_unprotected_needs_no_credentials() {
        assert!(authorize(&record(None), &HeaderMap::new()).is_ok());
    }

    #[test]
    fn test_protected_rejects_missing_header() {
        let err = authorize(&record(Some("hunter2")), &HeaderMap::new()).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[test]
    fn test_protected_accepts_correct_password() {
        let headers = basic_auth("reader", "hunter2");
        assert!(authorize(&record(Some("hunter2")), &headers).is_ok());
    }

    #[test]
    fn test_protected_rejects_wrong_password() {
        let headers = basic_auth("reader", "wrong");
        assert!(authorize(&record(Some("hunter2")), &headers).is_err());
    }

    #[test]
    fn test_password_may_contain_colons() {
        let headers = basic_auth("reader", "a:b:c");
        assert!(authorize(&record(Some("a:b:c")), &headers).is_ok());
    }
}
