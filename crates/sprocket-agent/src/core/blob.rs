use std::time::Duration;

use bytes::Bytes;
use sprocket_helpers::backoff::Backoff;
use sprocket_proto::{
    BlobGetRequest, BlobPutResponse, FrameHeader, MAX_BODY_LEN,
    MAX_HEADER_LEN, RpcStatus, method, read_frame_async, write_frame_async,
};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::core::client::{RpcError, classify_proto_error};

const BLOB_MAX_ATTEMPTS: usize = 3;

/// Blob store client. Transfers are one connection per operation; blob
/// bodies ride as raw frame bytes, not JSON.
pub struct BlobClient {
    addr: String,
    connect_timeout: Duration,
    backoff: Backoff,
}

impl BlobClient {
    pub fn new(addr: &str, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.to_string(),
            connect_timeout,
            backoff: Backoff::default(),
        }
    }

    pub async fn download(&self, blob_id: &str) -> Result<Bytes, RpcError> {
        let request = BlobGetRequest { blob_id: blob_id.to_string() };
        let body = serde_json::to_vec(&request)
            .map_err(|err| RpcError::Protocol(err.to_string()))?;
        let response = self.transfer(method::BLOB_GET, &body).await?;
        Ok(Bytes::from(response))
    }

    pub async fn upload(&self, data: Bytes) -> Result<String, RpcError> {
        let response = self.transfer(method::BLOB_PUT, &data).await?;
        let decoded: BlobPutResponse = serde_json::from_slice(&response)
            .map_err(|err| RpcError::Protocol(err.to_string()))?;
        Ok(decoded.blob_id)
    }

    async fn transfer(
        &self,
        kind: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, RpcError> {
        let mut attempt = 0_usize;
        loop {
            attempt += 1;
            match self.attempt(kind, body).await {
                Ok(response) => return Ok(response),
                Err(err)
                    if err.is_transient(&[]) && attempt < BLOB_MAX_ATTEMPTS =>
                {
                    let delay = self.backoff.delay(attempt);
                    debug!(
                        "transient blob failure, retrying: kind={}, attempt={}, error={}",
                        kind, attempt, err
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt(
        &self,
        kind: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, RpcError> {
        let mut stream =
            timeout(self.connect_timeout, TcpStream::connect(&self.addr))
                .await
                .map_err(|_| {
                    RpcError::Transport(format!(
                        "blob connect timed out: {}",
                        self.addr
                    ))
                })?
                .map_err(|err| {
                    RpcError::Transport(format!(
                        "blob connect failed: {}: {err}",
                        self.addr
                    ))
                })?;

        let header = FrameHeader::request(kind);
        write_frame_async(&mut stream, &header, body)
            .await
            .map_err(classify_proto_error)?;
        let (response, response_body) =
            read_frame_async(&mut stream, MAX_HEADER_LEN, MAX_BODY_LEN)
                .await
                .map_err(classify_proto_error)?;

        match response.status {
            Some(RpcStatus::Ok) => Ok(response_body),
            Some(status) => Err(RpcError::Status {
                kind: kind.to_string(),
                status,
                message: response.message.unwrap_or_default(),
            }),
            None => Err(RpcError::Protocol(format!(
                "blob response frame for {kind} carries no status"
            ))),
        }
    }
}
