//! Latency probing.
//!
//! A probe is one minimal round trip against `/ping`. Probes are issued
//! strictly sequentially by the session; parallel probes would congest
//! the link and skew the latency they are measuring.

use chrono::Utc;
use log::debug;
use reqwest::header::CACHE_CONTROL;
use reqwest::Client;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::MeasureError;

/// One round trip in milliseconds.
///
/// The timestamp and random nonce query parameters defeat intermediate
/// caches; the server ignores them. The round trip is not over until
/// the body has arrived.
pub async fn probe_once(
    client: &Client,
    base: &str,
    cancel: &CancellationToken,
) -> Result<f64, MeasureError> {
    let url = format!(
        "{}/ping?ts={}&r={:016x}",
        base,
        Utc::now().timestamp_millis(),
        rand::random::<u64>()
    );
    debug!("probe: GET {}", url);

    let started = Instant::now();
    tokio::select! {
        done = round_trip(client, &url) => done?,
        _ = cancel.cancelled() => {
            return Err(MeasureError::cancelled("probe aborted"));
        }
    }

    Ok(started.elapsed().as_secs_f64() * 1000.0)
}

async fn round_trip(client: &Client, url: &str) -> Result<(), MeasureError> {
    let response = client
        .get(url)
        .header(CACHE_CONTROL, "no-store")
        .send()
        .await
        .map_err(|e| MeasureError::from_reqwest("ping request failed", e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(MeasureError::http_status(format!(
            "ping returned {}",
            status
        )));
    }

    response
        .bytes()
        .await
        .map_err(|e| MeasureError::from_reqwest("ping body failed", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::server;

    async fn spawn_server(app: axum::Router) -> String {
        let listener =
            tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_probe_measures_round_trip() {
        let base = spawn_server(server::router()).await;
        let client = Client::new();
        let cancel = CancellationToken::new();

        let elapsed =
            probe_once(&client, &base, &cancel).await.unwrap();

        assert!(elapsed >= 0.0);
    }

    #[tokio::test]
    async fn test_probe_fails_on_missing_endpoint() {
        let base = spawn_server(axum::Router::new()).await;
        let client = Client::new();
        let cancel = CancellationToken::new();

        let err = probe_once(&client, &base, &cancel).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::HttpStatus);
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_probe() {
        let base = spawn_server(server::router()).await;
        let client = Client::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = probe_once(&client, &base, &cancel).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Cancelled);
    }
}
