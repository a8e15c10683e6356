//! GSLB status client.
//!
//! GSLB servers expose a plain HTTP `/status` endpoint; the control plane
//! only cares whether it answers 200 within the probe deadline, plus the
//! raw body for the pass-through info endpoint.

use crate::error::{CacheMgrError, Result};
use async_trait::async_trait;
use std::time::Duration;

/// GSLB probe as seen by the service; tests substitute a stub.
#[async_trait]
pub trait GslbOps: Send + Sync {
    /// Fetch `/status` from `addr`, failing on any non-200 answer.
    async fn status(&self, addr: &str, timeout: Duration) -> Result<Vec<u8>>;
}

pub struct HttpGslbClient {
    client: reqwest::Client,
}

impl HttpGslbClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpGslbClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GslbOps for HttpGslbClient {
    async fn status(&self, addr: &str, timeout: Duration) -> Result<Vec<u8>> {
        let url = format!("http://{}/status", addr);
        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CacheMgrError::Timeout(format!("gslb status {}", addr))
                } else {
                    CacheMgrError::Network(format!("gslb status {}: {}", addr, e))
                }
            })?;
        if !response.status().is_success() {
            return Err(CacheMgrError::Network(format!(
                "gslb status {}: http {}",
                addr,
                response.status().as_u16()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| CacheMgrError::Network(format!("gslb status {}: {}", addr, e)))?;
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn http_server(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut sink = vec![0u8; 2048];
            let _ = socket.read(&mut sink).await;
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
        });
        addr
    }

    #[tokio::test]
    async fn test_status_ok() {
        let addr = http_server("200 OK", "haproxy up").await;
        let client = HttpGslbClient::new();
        let body = client.status(&addr, Duration::from_secs(2)).await.unwrap();
        assert_eq!(body, b"haproxy up");
    }

    #[tokio::test]
    async fn test_status_non_200_is_error() {
        let addr = http_server("503 Service Unavailable", "down").await;
        let client = HttpGslbClient::new();
        assert!(client.status(&addr, Duration::from_secs(2)).await.is_err());
    }

    #[tokio::test]
    async fn test_status_unreachable_is_error() {
        let client = HttpGslbClient::new();
        assert!(client
            .status("127.0.0.1:1", Duration::from_millis(500))
            .await
            .is_err());
    }
}
