use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use sprocket_helpers::backoff::Backoff;
use sprocket_proto::{
    AuthInfo, FrameHeader, GetInputsRequest, GetInputsResponse,
    GetSerializedRequest, GetSerializedResponse, HeartbeatRequest,
    MAX_BODY_LEN, MAX_HEADER_LEN, OutputRecord, PutOutputsRequest, RpcStatus,
    TaskResultRequest, method, read_frame_async, write_frame_async,
};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::config::Config;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rpc attempt deadline exceeded after {0:.1?}")]
    Deadline(Duration),
    #[error("rpc {kind} failed: status={status}, message={message}")]
    Status { kind: String, status: RpcStatus, message: String },
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RpcError {
    /// Transport drops and attempt deadlines are always transient; status
    /// errors are transient per `RpcStatus::is_transient` widened by the
    /// caller's extra set. Protocol violations never are.
    pub fn is_transient(&self, additional: &[RpcStatus]) -> bool {
        match self {
            Self::Transport(_) | Self::Deadline(_) => true,
            Self::Status { status, .. } => {
                status.is_transient() || additional.contains(status)
            }
            Self::Protocol(_) => false,
        }
    }
}

/// Per-call retry knobs. The defaults match the plain unary calls; output
/// submission tightens the attempt deadline and widens the transient set.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub attempt_timeout: Option<Duration>,
    pub total_timeout: Option<Duration>,
    pub max_attempts: Option<usize>,
    pub additional_statuses: Vec<RpcStatus>,
}

const DEFAULT_MAX_ATTEMPTS: usize = 3;
const OUTPUT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);
const OUTPUT_TOTAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Control-plane RPC client: persistent connections re-dialed per attempt
/// after any transport failure. Heartbeats ride a dedicated connection so
/// they never queue behind a long input poll.
pub struct ControlClient {
    addr: String,
    auth: Option<AuthInfo>,
    connect_timeout: Duration,
    heartbeat_timeout: Duration,
    backoff: Backoff,
    conn: Mutex<Option<TcpStream>>,
    heartbeat_conn: Mutex<Option<TcpStream>>,
}

impl ControlClient {
    pub fn new(addr: &str, config: &Config) -> Self {
        let auth = match (&config.token_id, &config.token_secret) {
            (Some(token_id), Some(token_secret)) => Some(AuthInfo {
                token_id: token_id.clone(),
                token_secret: token_secret.clone(),
            }),
            _ => None,
        };
        Self {
            addr: addr.to_string(),
            auth,
            connect_timeout: config.connect_timeout,
            heartbeat_timeout: config.heartbeat_timeout,
            backoff: Backoff::default(),
            conn: Mutex::new(None),
            heartbeat_conn: Mutex::new(None),
        }
    }

    pub async fn heartbeat(
        &self,
        request: &HeartbeatRequest,
    ) -> Result<(), RpcError> {
        let opts = CallOptions {
            attempt_timeout: Some(self.heartbeat_timeout),
            ..CallOptions::default()
        };
        let body = serde_json::to_vec(request)
            .map_err(|err| RpcError::Protocol(err.to_string()))?;
        self.call_on(
            &self.heartbeat_conn,
            method::CONTAINER_HEARTBEAT,
            &body,
            &opts,
        )
        .await?;
        Ok(())
    }

    pub async fn get_inputs(
        &self,
        request: &GetInputsRequest,
    ) -> Result<GetInputsResponse, RpcError> {
        self.call_json(
            method::FUNCTION_GET_INPUTS,
            request,
            &CallOptions::default(),
        )
        .await
    }

    pub async fn get_serialized(
        &self,
        function_id: &str,
    ) -> Result<GetSerializedResponse, RpcError> {
        let request =
            GetSerializedRequest { function_id: function_id.to_string() };
        self.call_json(
            method::FUNCTION_GET_SERIALIZED,
            &request,
            &CallOptions::default(),
        )
        .await
    }

    pub async fn put_outputs(
        &self,
        outputs: Vec<OutputRecord>,
    ) -> Result<(), RpcError> {
        let opts = CallOptions {
            attempt_timeout: Some(OUTPUT_ATTEMPT_TIMEOUT),
            total_timeout: Some(OUTPUT_TOTAL_TIMEOUT),
            max_attempts: Some(usize::MAX),
            additional_statuses: vec![RpcStatus::ResourceExhausted],
        };
        let request = PutOutputsRequest { outputs };
        self.call_json::<_, serde_json::Value>(
            method::FUNCTION_PUT_OUTPUTS,
            &request,
            &opts,
        )
        .await?;
        Ok(())
    }

    pub async fn task_result(
        &self,
        request: &TaskResultRequest,
    ) -> Result<(), RpcError> {
        self.call_json::<_, serde_json::Value>(
            method::TASK_RESULT,
            request,
            &CallOptions::default(),
        )
        .await?;
        Ok(())
    }

    async fn call_json<Req, Resp>(
        &self,
        kind: &str,
        request: &Req,
        opts: &CallOptions,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(request)
            .map_err(|err| RpcError::Protocol(err.to_string()))?;
        let response = self.call(kind, &body, opts).await?;
        if response.is_empty() {
            return serde_json::from_slice(b"null")
                .map_err(|err| RpcError::Protocol(err.to_string()));
        }
        serde_json::from_slice(&response)
            .map_err(|err| RpcError::Protocol(err.to_string()))
    }

    /// Runs one RPC through the transient-retry loop.
    pub async fn call(
        &self,
        kind: &str,
        body: &[u8],
        opts: &CallOptions,
    ) -> Result<Vec<u8>, RpcError> {
        self.call_on(&self.conn, kind, body, opts).await
    }

    async fn call_on(
        &self,
        conn: &Mutex<Option<TcpStream>>,
        kind: &str,
        body: &[u8],
        opts: &CallOptions,
    ) -> Result<Vec<u8>, RpcError> {
        let started = Instant::now();
        let max_attempts = opts.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
        let mut attempt = 0_usize;

        loop {
            attempt += 1;
            let result = match opts.attempt_timeout {
                Some(deadline) => {
                    match timeout(deadline, self.attempt(conn, kind, body))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => {
                            *conn.lock().await = None;
                            Err(RpcError::Deadline(deadline))
                        }
                    }
                }
                None => self.attempt(conn, kind, body).await,
            };

            let err = match result {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            if !err.is_transient(&opts.additional_statuses)
                || attempt >= max_attempts
            {
                return Err(err);
            }
            if let Some(total) = opts.total_timeout {
                if started.elapsed() >= total {
                    return Err(err);
                }
            }

            let mut delay = self.backoff.delay(attempt);
            if let Some(total) = opts.total_timeout {
                let remaining = total.saturating_sub(started.elapsed());
                delay = delay.min(remaining);
            }
            debug!(
                "transient rpc failure, retrying: kind={}, attempt={}, delay={:?}, error={}",
                kind, attempt, delay, err
            );
            sleep(delay).await;
        }
    }

    async fn attempt(
        &self,
        conn: &Mutex<Option<TcpStream>>,
        kind: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, RpcError> {
        let mut guard = conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.dial().await?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(RpcError::Transport("connection missing".to_string()));
        };

        let header =
            FrameHeader::request_with_auth(kind, self.auth.clone());
        let exchange = async {
            write_frame_async(stream, &header, body).await?;
            read_frame_async(stream, MAX_HEADER_LEN, MAX_BODY_LEN).await
        };

        let (response, response_body) = match exchange.await {
            Ok(frame) => frame,
            Err(err) => {
                *guard = None;
                return Err(classify_proto_error(err));
            }
        };

        match response.status {
            Some(RpcStatus::Ok) => Ok(response_body),
            Some(status) => Err(RpcError::Status {
                kind: kind.to_string(),
                status,
                message: response.message.unwrap_or_default(),
            }),
            None => {
                *guard = None;
                Err(RpcError::Protocol(format!(
                    "response frame for {kind} carries no status"
                )))
            }
        }
    }

    /// Opens a dedicated connection for a server-streaming call. Data
    /// frame bodies are forwarded on the returned channel until the
    /// server sends the EOF frame or the connection drops.
    pub async fn open_stream(
        &self,
        kind: &str,
        body: &[u8],
    ) -> Result<mpsc::Receiver<Vec<u8>>, RpcError> {
        let mut stream = self.dial().await?;
        let header =
            FrameHeader::request_with_auth(kind, self.auth.clone());
        write_frame_async(&mut stream, &header, body)
            .await
            .map_err(classify_proto_error)?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                let frame =
                    read_frame_async(&mut stream, MAX_HEADER_LEN, MAX_BODY_LEN)
                        .await;
                match frame {
                    Ok((header, body))
                        if header.kind == method::PTY_DATA =>
                    {
                        if tx.send(body).await.is_err() {
                            break;
                        }
                    }
                    Ok((header, _)) if header.kind == method::PTY_EOF => {
                        break;
                    }
                    Ok((header, _)) => {
                        warn!(
                            "unexpected stream frame: kind={}",
                            header.kind
                        );
                    }
                    Err(err) => {
                        warn!("input stream closed: error={err}");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn dial(&self) -> Result<TcpStream, RpcError> {
        let connected =
            timeout(self.connect_timeout, TcpStream::connect(&self.addr))
                .await
                .map_err(|_| {
                    RpcError::Transport(format!(
                        "connect timed out: {}",
                        self.addr
                    ))
                })?
                .map_err(|err| {
                    RpcError::Transport(format!(
                        "connect failed: {}: {err}",
                        self.addr
                    ))
                })?;
        connected.set_nodelay(true).ok();
        Ok(connected)
    }
}

pub(crate) fn classify_proto_error(err: sprocket_proto::ProtoError) -> RpcError {
    match err {
        sprocket_proto::ProtoError::Io(err) => {
            RpcError::Transport(err.to_string())
        }
        other => RpcError::Protocol(other.to_string()),
    }
}
