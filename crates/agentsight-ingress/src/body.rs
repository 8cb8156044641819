// Request body handling
//
// The Content-Length header is advisory only: the raw read and the gzip
// inflate both enforce the configured byte ceiling on the actual bytes.

use std::io::Read;

use axum::body::Body;
use flate2::read::GzDecoder;
use futures::StreamExt;

use crate::error::IngressError;

/// Read the request body, failing as soon as it crosses the ceiling.
pub async fn read_limited(body: Body, max_bytes: usize) -> Result<Vec<u8>, IngressError> {
    let mut stream = body.into_data_stream();
    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| IngressError::BadRequest(format!("body read failed: {e}")))?;
        if collected.len() + chunk.len() > max_bytes {
            return Err(IngressError::PayloadTooLarge(max_bytes));
        }
        collected.extend_from_slice(&chunk);
    }
    Ok(collected)
}

/// Inflate a gzip body with the same ceiling applied to the output.
pub fn decompress_limited(data: &[u8], max_bytes: usize) -> Result<Vec<u8>, IngressError> {
    let mut decoder = GzDecoder::new(data);
    let mut inflated = Vec::new();
    let mut chunk = [0u8; 8 * 1024];
    loop {
        let read = decoder
            .read(&mut chunk)
            .map_err(|e| IngressError::BadRequest(format!("invalid gzip body: {e}")))?;
        if read == 0 {
            return Ok(inflated);
        }
        if inflated.len() + read > max_bytes {
            return Err(IngressError::PayloadTooLarge(max_bytes));
        }
        inflated.extend_from_slice(&chunk[..read]);
    }
}
