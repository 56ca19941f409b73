use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use sprocket_proto::{PtyInfo, PtyInputRequest, method};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::client::{ControlClient, RpcError};

/// In-process terminal input: the PTY shim feeds server keystrokes in,
/// interactive handlers read them out. Reads work from both the
/// cooperative scheduler and the sync user thread.
pub struct TerminalInput {
    buffer: Mutex<VecDeque<u8>>,
    available: Condvar,
}

impl TerminalInput {
    fn new() -> Self {
        Self { buffer: Mutex::new(VecDeque::new()), available: Condvar::new() }
    }

    pub fn push(&self, bytes: &[u8]) {
        let mut buffer = self.buffer.lock().expect("terminal lock poisoned");
        buffer.extend(bytes);
        self.available.notify_all();
    }

    /// Drains whatever is buffered without waiting.
    pub fn read_available(&self) -> Vec<u8> {
        let mut buffer = self.buffer.lock().expect("terminal lock poisoned");
        buffer.drain(..).collect()
    }

    /// Blocks the calling thread until input arrives or the timeout
    /// elapses. Meant for the sync user thread, never the scheduler.
    pub fn read_blocking(&self, timeout: Duration) -> Option<Vec<u8>> {
        let buffer = self.buffer.lock().expect("terminal lock poisoned");
        let (mut buffer, result) = self
            .available
            .wait_timeout_while(buffer, timeout, |buffer| buffer.is_empty())
            .expect("terminal lock poisoned");
        if result.timed_out() && buffer.is_empty() {
            return None;
        }
        Some(buffer.drain(..).collect())
    }
}

pub fn terminal_input() -> &'static TerminalInput {
    static INPUT: OnceLock<TerminalInput> = OnceLock::new();
    INPUT.get_or_init(TerminalInput::new)
}

/// Forwards the server keystroke stream into the terminal input buffer
/// while a PTY-enabled handler runs.
pub struct PtyShim {
    stop: CancellationToken,
    forwarder: JoinHandle<()>,
}

impl PtyShim {
    pub async fn start(
        client: Arc<ControlClient>,
        task_id: &str,
        pty_info: &PtyInfo,
    ) -> Result<Self, RpcError> {
        debug!(
            "starting pty shim: task_id={}, rows={}, cols={}",
            task_id, pty_info.winsz_rows, pty_info.winsz_cols
        );
        let request = PtyInputRequest { task_id: task_id.to_string() };
        let body = serde_json::to_vec(&request)
            .map_err(|err| RpcError::Protocol(err.to_string()))?;
        let mut stream = client.open_stream(method::PTY_INPUT, &body).await?;

        let stop = CancellationToken::new();
        let forward_stop = stop.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = forward_stop.cancelled() => break,
                    chunk = stream.recv() => {
                        let Some(bytes) = chunk else {
                            debug!("pty input stream ended");
                            break;
                        };
                        trace!("pty keystrokes received: bytes={}", bytes.len());
                        terminal_input().push(&bytes);
                    }
                }
            }
        });

        Ok(Self { stop, forwarder })
    }

    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(err) = self.forwarder.await {
            warn!("pty forwarder join failed: error={err}");
        }
    }
}
