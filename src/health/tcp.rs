//! TCP health checks.
//!
//! Connect, optionally write a payload, then read until every expected
//! segment has been seen. With no expected segments a successful connect
//! passes.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::health::settings::ProbePayload;
use crate::health::transport::{ProbeError, ProbeResponse, ProbeTransport};

/// Upper bound on bytes buffered while waiting for the expected response.
const MAX_RESPONSE_BYTES: usize = 64 * 1024;

/// Fuzzy response matcher: each segment must appear in the buffer, in order,
/// with arbitrary bytes allowed before, between and after segments.
pub struct TcpHealthCheckMatcher;

impl TcpHealthCheckMatcher {
    pub fn matches(expected: &[Vec<u8>], buffer: &[u8]) -> bool {
        let mut start = 0;
        for segment in expected {
            if segment.is_empty() {
                continue;
            }
            match find(&buffer[start..], segment) {
                Some(pos) => start += pos + segment.len(),
                None => return false,
            }
        }
        true
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[derive(Debug, Default)]
pub struct TcpProbeTransport;

#[async_trait]
impl ProbeTransport for TcpProbeTransport {
    async fn probe(&self, address: &str, payload: &ProbePayload) -> Result<ProbeResponse, ProbeError> {
        let ProbePayload::Tcp { send, receive } = payload else {
            return Err(ProbeError::UnsupportedPayload(payload.kind()));
        };

        let mut stream = TcpStream::connect(address).await.map_err(ProbeError::Connect)?;
        if let Some(send) = send {
            stream.write_all(send).await.map_err(ProbeError::Io)?;
        }
        if receive.is_empty() {
            return Ok(ProbeResponse::Healthy);
        }

        let mut buffer = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.map_err(ProbeError::Io)?;
            if n == 0 {
                return Err(ProbeError::UnexpectedResponse(
                    "connection closed before expected response".to_string(),
                ));
            }
            buffer.extend_from_slice(&chunk[..n]);
            if TcpHealthCheckMatcher::matches(receive, &buffer) {
                return Ok(ProbeResponse::Healthy);
            }
            if buffer.len() > MAX_RESPONSE_BYTES {
                return Err(ProbeError::UnexpectedResponse(format!(
                    "no match in first {} bytes",
                    buffer.len()
                )));
            }
        }
    }
}
