//! Timed transfer primitives.
//!
//! One invocation performs one HTTP exchange while measuring wall-clock
//! duration and bytes moved. The caller owns the timeout; cancellation
//! arrives through the token.

use futures::StreamExt;
use log::debug;
use reqwest::header::CACHE_CONTROL;
use reqwest::Client;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::MeasureError;
use crate::payload;

/// Bytes moved and wall-clock time for one HTTP exchange.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferResult {
    pub bytes: u64,
    pub elapsed_ms: f64,
}

/// Fetch `bytes` random bytes from the server, reading the streamed
/// body to the end and summing received chunk lengths.
///
/// The response carries no Content-Length, so the received count is the
/// only source of truth for the transfer size.
pub async fn download(
    client: &Client,
    base: &str,
    bytes: u64,
    cancel: &CancellationToken,
) -> Result<TransferResult, MeasureError> {
    let url = format!(
        "{}/download?size={}&r={:016x}",
        base,
        bytes,
        rand::random::<u64>()
    );
    debug!("download: GET {}", url);

    let started = Instant::now();
    let received = tokio::select! {
        received = read_download_body(client, &url, bytes) => received?,
        _ = cancel.cancelled() => {
            return Err(MeasureError::cancelled("download aborted"));
        }
    };

    Ok(TransferResult { bytes: received, elapsed_ms: elapsed_ms(started) })
}

async fn read_download_body(
    client: &Client,
    url: &str,
    expected: u64,
) -> Result<u64, MeasureError> {
    let response = client
        .get(url)
        .header(CACHE_CONTROL, "no-store")
        .send()
        .await
        .map_err(|e| MeasureError::from_reqwest("download request failed", e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(MeasureError::http_status(format!(
            "download returned {}",
            status
        )));
    }

    let mut stream = response.bytes_stream();
    let mut received: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(|e| MeasureError::from_reqwest("download body failed", e))?;
        received += chunk.len() as u64;
    }

    if expected > 0 && received == 0 {
        return Err(MeasureError::missing_body(
            "download response carried no body",
        ));
    }

    Ok(received)
}

/// Send `bytes` random bytes to the server and await its terminal
/// response.
///
/// Payload generation happens before the clock starts; only the network
/// exchange is timed. Any 2xx answer counts as success, including the
/// server's deliberate 204 No Content.
pub async fn upload(
    client: &Client,
    base: &str,
    bytes: u64,
    cancel: &CancellationToken,
) -> Result<TransferResult, MeasureError> {
    let url = format!("{}/upload?r={:016x}", base, rand::random::<u64>());
    let body = payload::generate(bytes as usize);
    debug!("upload: POST {} ({} bytes)", url, bytes);

    let started = Instant::now();
    tokio::select! {
        sent = send_upload_body(client, &url, body) => sent?,
        _ = cancel.cancelled() => {
            return Err(MeasureError::cancelled("upload aborted"));
        }
    }

    Ok(TransferResult { bytes, elapsed_ms: elapsed_ms(started) })
}

async fn send_upload_body(
    client: &Client,
    url: &str,
    body: Vec<u8>,
) -> Result<(), MeasureError> {
    let response = client
        .post(url)
        .header(CACHE_CONTROL, "no-store")
        .body(body)
        .send()
        .await
        .map_err(|e| MeasureError::from_reqwest("upload request failed", e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(MeasureError::http_status(format!(
            "upload returned {}",
            status
        )));
    }

    Ok(())
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
