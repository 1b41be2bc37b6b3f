//! The measurement server: the `/download`, `/upload` and `/ping`
//! endpoints the client's transfer primitives consume.
//!
//! Every endpoint answers with the full no-cache header set: a cached
//! response would make a download instantaneous and corrupt the
//! measurement. CORS allows any origin so a browser client can call a
//! server on another host.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Query};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use futures::StreamExt;
use log::{debug, info};
use serde::Deserialize;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::payload;

/// Bytes streamed when the download request names no valid size.
pub const DEFAULT_DOWNLOAD_BYTES: u64 = 10_485_760;

/// Size of each streamed chunk of a download body.
pub const STREAM_CHUNK_BYTES: usize = 64 * 1024;

/// Upper bound on upload bodies.
const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

/// Build the measurement router.
pub fn router() -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/download", get(download))
        .route("/upload", post(upload))
        .route("/ping", get(ping))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
}

/// Bind and serve until ctrl-c (or SIGTERM on unix).
pub async fn serve(bind: SocketAddr) -> io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("linespeed server listening on {}", bind);

    axum::serve(listener, router())
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        )
        .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received ctrl-c, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received ctrl-c, shutting down");
    }
}

fn no_cache_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate, max-age=0"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    headers
}

#[derive(Debug, Deserialize)]
pub(crate) struct DownloadParams {
    size: Option<String>,
}

/// GET /download?size=N: a stream of exactly `max(1, N)` random bytes
/// in 64 KiB chunks with no Content-Length; transformation in transit
/// is disabled so the bytes on the wire are the bytes measured. An
/// absent or unparseable size falls back to the default.
async fn download(Query(params): Query<DownloadParams>) -> Response {
    let size = params
        .size
        .as_deref()
        .and_then(|raw| raw.parse::<i64>().ok())
        .map(|n| n.max(1) as u64)
        .unwrap_or(DEFAULT_DOWNLOAD_BYTES);

    debug!("download: streaming {} bytes", size);

    let stream = async_stream::stream! {
        let mut remaining = size;
        while remaining > 0 {
            let len = remaining.min(STREAM_CHUNK_BYTES as u64) as usize;
            yield Ok::<Bytes, Infallible>(Bytes::from(payload::generate(len)));
            remaining -= len as u64;
        }
    };

    let mut headers = no_cache_headers();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(
            "no-store, no-cache, must-revalidate, max-age=0, no-transform",
        ),
    );
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_static("attachment; filename=\"bin.dat\""),
    );
    headers.insert(
        header::CONTENT_ENCODING,
        HeaderValue::from_static("identity"),
    );

    (headers, Body::from_stream(stream)).into_response()
}

/// POST /upload: drain and discard the body, then answer 204 No
/// Content. The client measures the time to this terminal response, so
/// the body must be fully consumed first.
async fn upload(body: Body) -> Response {
    let mut stream = body.into_data_stream();
    let mut received: u64 = 0;

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => received += bytes.len() as u64,
            Err(error) => {
                debug!(
                    "upload body aborted after {} bytes: {}",
                    received, error
                );
                return (StatusCode::BAD_REQUEST, no_cache_headers())
                    .into_response();
            }
        }
    }

    debug!("upload: drained {} bytes", received);
    (StatusCode::NO_CONTENT, no_cache_headers()).into_response()
}

/// GET /ping: fixed tiny body, returned immediately. The
/// cache-defeating query parameters clients send are ignored.
async fn ping() -> Response {
    let mut headers = no_cache_headers();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );

    (headers, "pong").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_download_returns_exact_byte_count() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/download?size=100")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
        assert_eq!(response.headers()[header::CONTENT_ENCODING], "identity");
        let cache =
            response.headers()[header::CACHE_CONTROL].to_str().unwrap();
        assert!(cache.contains("no-store"));
        assert!(cache.contains("no-transform"));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.len(), 100);
    }

    #[tokio::test]
    async fn test_download_spans_chunk_boundaries() {
        let size = STREAM_CHUNK_BYTES * 2 + 5;
        let response = router()
            .oneshot(
                Request::builder()
                    .uri(format!("/download?size={}", size))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.len(), size);
    }

    #[tokio::test]
    async fn test_download_defaults_when_size_invalid() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/download?size=banana")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.len() as u64, DEFAULT_DOWNLOAD_BYTES);
    }

    #[tokio::test]
    async fn test_download_clamps_size_to_at_least_one() {
        for query in ["/download?size=0", "/download?size=-5"] {
            let response = router()
                .oneshot(
                    Request::builder().uri(query).body(Body::empty()).unwrap(),
                )
                .await
                .unwrap();

            let body =
                response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(body.len(), 1, "query {} should stream one byte", query);
        }
    }

    #[tokio::test]
    async fn test_upload_returns_no_content() {
        let response = router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/upload")
                    .body(Body::from(payload::generate(1000)))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let cache =
            response.headers()[header::CACHE_CONTROL].to_str().unwrap();
        assert!(cache.contains("no-store"));
    }

    #[tokio::test]
    async fn test_get_upload_is_method_not_allowed() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/upload")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_ping_returns_pong_and_ignores_params() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/ping?ts=1700000000000&r=deadbeef")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let cache =
            response.headers()[header::CACHE_CONTROL].to_str().unwrap();
        assert!(cache.contains("no-store"));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"pong");
    }

    #[tokio::test]
    async fn test_cors_allows_any_origin() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/ping")
                    .header(header::ORIGIN, "http://example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
    }
}
