//! Read-only HTTP file server over a bucket

use crate::error::ApiError;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap},
    response::Response,
    routing::get,
    Router,
};
use blobfs_core::Bucket;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Debug, Default, Deserialize)]
pub struct ServeParams {
    /// File name offered to the browser
    #[serde(default)]
    pub name: Option<String>,
    /// Always download, never display inline
    #[serde(default)]
    pub download: bool,
}

/// `GET /{key}` streams the blob, honoring `Range`
pub fn create_router(bucket: Bucket) -> Router {
    Router::new()
        .route("/{*key}", get(get_blob))
        .layer(TraceLayer::new_for_http())
        .with_state(bucket)
}

async fn get_blob(
    State(bucket): State<Bucket>,
    Path(key): Path<String>,
    Query(params): Query<ServeParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let range = match headers.get(header::RANGE) {
        Some(value) => Some(
            value
                .to_str()
                .map_err(|_| ApiError::BadRequest("Range header is not ASCII".into()))?,
        ),
        None => None,
    };
    let name = params.name.as_deref().unwrap_or_default();
    Ok(bucket.serve(&key, name, range, params.download).await?)
}

/// Serve `bucket` until ctrl-c, then close it
pub async fn run_server(bucket: Bucket, addr: &str) -> anyhow::Result<()> {
    let app = create_router(bucket.clone());
    let listener = TcpListener::bind(addr).await?;
    info!("blobfs serving on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    bucket.close().await?;
    info!("shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, http::StatusCode};
    use blobfs_core::LocalOptions;
    use tower::ServiceExt;

    async fn app() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let bucket = Bucket::open_local(dir.path(), LocalOptions::default()).unwrap();
        bucket.upload(b"0123456789", "docs/digits.txt").await.unwrap();
        (dir, create_router(bucket))
    }

    #[tokio::test]
    async fn test_get_blob() {
        let (_dir, app) = app().await;
        let response = app
            .oneshot(Request::get("/docs/digits.txt").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"digits.txt\""
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"0123456789");
    }

    #[tokio::test]
    async fn test_get_range_and_name() {
        let (_dir, app) = app().await;
        let request = Request::get("/docs/digits.txt?name=n.txt&download=true")
            .header(header::RANGE, "bytes=-4")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"n.txt\""
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"6789");
    }

    #[tokio::test]
    async fn test_missing_blob() {
        let (_dir, app) = app().await;
        let response = app
            .oneshot(Request::get("/nope.txt").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
