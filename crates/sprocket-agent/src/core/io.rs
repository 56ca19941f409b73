use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use sprocket_proto::{
    ArgsPayload, ContainerArguments, FunctionDef, GenStatus, GenericResult,
    GetInputsRequest, InputArgs, OutputRecord, ResultStatus,
    TaskResultRequest, Value, decode_args, encode_exception, encode_value,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::AgentError;
use super::blob::BlobClient;
use super::client::ControlClient;
use super::registry::HandlerError;
use super::traceback::{extract_traceback, format_traceback};

/// Conservative estimate of control-plane round-trip time, used to size
/// the advisory prefetch depth.
const RTT_S: f64 = 0.5;
/// Payloads above this size leave the output record and go to the blob
/// store instead.
pub const MAX_OBJECT_SIZE_BYTES: usize = 2 * 1024 * 1024;

const OUTPUT_QUEUE_CAPACITY: usize = 64;
const OUTPUT_MAX_BATCH: usize = 100;
const OUTPUT_DEBOUNCE: Duration = Duration::from_millis(15);
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Per-process call statistics. Owned by the I/O manager; the heartbeat
/// loop only snapshots it.
#[derive(Debug, Clone, Default)]
pub struct IoStats {
    pub calls_completed: u64,
    pub total_user_time: f64,
    pub current_input_id: Option<String>,
    pub current_input_started_at: Option<f64>,
    // When the user-time clock is ticking: set on dispatch and on every
    // resumption, drained into `total_user_time` when the handler hands
    // a value back. Output serialization and RPC time never count.
    clock_running_since: Option<f64>,
}

/// One decoded unit of work ready for the dispatcher.
#[derive(Debug)]
pub struct PreparedInput {
    pub input_id: String,
    pub args: ArgsPayload,
}

/// Drives the input/output traffic for one container: polls the control
/// plane for inputs, materializes blob arguments, tracks call statistics,
/// and funnels outputs through a batched background submitter.
pub struct FunctionIoManager {
    pub task_id: String,
    pub function_id: String,
    pub app_id: String,
    pub function_def: FunctionDef,
    client: Arc<ControlClient>,
    blobs: Arc<BlobClient>,
    shutdown: CancellationToken,
    stats: Arc<Mutex<IoStats>>,
    eof: AtomicBool,
    output_tx: mpsc::Sender<Option<OutputRecord>>,
    output_rx: Mutex<Option<mpsc::Receiver<Option<OutputRecord>>>>,
}

impl FunctionIoManager {
    pub fn new(
        container_args: &ContainerArguments,
        client: Arc<ControlClient>,
        blobs: Arc<BlobClient>,
        shutdown: CancellationToken,
    ) -> Self {
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);
        Self {
            task_id: container_args.task_id.clone(),
            function_id: container_args.function_id.clone(),
            app_id: container_args.app_id.clone(),
            function_def: container_args.function_def.clone(),
            client,
            blobs,
            shutdown,
            stats: Arc::new(Mutex::new(IoStats::default())),
            eof: AtomicBool::new(false),
            output_tx,
            output_rx: Mutex::new(Some(output_rx)),
        }
    }

    pub fn stats_handle(&self) -> Arc<Mutex<IoStats>> {
        self.stats.clone()
    }

    pub fn client(&self) -> Arc<ControlClient> {
        self.client.clone()
    }

    fn average_call_time(&self) -> f64 {
        let stats = self.stats.lock().expect("stats lock poisoned");
        if stats.calls_completed == 0 {
            return 0.0;
        }
        stats.total_user_time / stats.calls_completed as f64
    }

    /// Advisory prefetch depth; still sent although the server no longer
    /// honors it.
    fn max_inputs_to_fetch(&self) -> u64 {
        let stats = self.stats.lock().expect("stats lock poisoned");
        if stats.calls_completed == 0 {
            return 1;
        }
        let avg =
            (stats.total_user_time / stats.calls_completed as f64).max(1e-6);
        (RTT_S / avg).ceil() as u64
    }

    /// Pulls the next input to dispatch. Returns `None` on EOF: kill
    /// switch, a completed final input, or shutdown cancellation.
    pub async fn next_input(
        &self,
    ) -> Result<Option<PreparedInput>, AgentError> {
        if self.eof.load(Ordering::SeqCst) {
            return Ok(None);
        }

        loop {
            let request = GetInputsRequest {
                function_id: self.function_id.clone(),
                average_call_time: self.average_call_time(),
                max_values: self.max_inputs_to_fetch(),
            };

            let response = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(None),
                response = self.client.get_inputs(&request) => response?,
            };

            if let Some(secs) = response.rate_limit_sleep_duration {
                if secs > 0.0 {
                    info!(
                        "task exceeded rate limit, sleeping before next poll: duration={:.2}s",
                        secs
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(None),
                        _ = sleep(Duration::from_secs_f64(secs)) => {}
                    }
                    continue;
                }
            }

            if response.inputs.is_empty() {
                debug!("input poll returned no envelope, repolling");
                continue;
            }
            if response.inputs.len() > 1 {
                return Err(AgentError::Internal(format!(
                    "control plane returned {} inputs in one response",
                    response.inputs.len()
                )));
            }
            let envelope = response.inputs.into_iter().next()
                .ok_or_else(|| {
                    AgentError::Internal("input envelope missing".to_string())
                })?;

            if envelope.kill_switch {
                debug!(
                    "input carried kill switch: task_id={}",
                    self.task_id
                );
                self.eof.store(true, Ordering::SeqCst);
                return Ok(None);
            }

            let args_bytes = match envelope.args {
                None => None,
                Some(InputArgs::Inline(bytes)) => Some(bytes),
                Some(InputArgs::BlobId(blob_id)) => {
                    Some(self.blobs.download(&blob_id).await?.to_vec())
                }
            };
            let args = match args_bytes {
                Some(bytes) => decode_args(&bytes)?,
                None => ArgsPayload::default(),
            };

            if envelope.final_input {
                self.eof.store(true, Ordering::SeqCst);
            }

            {
                let started_at = unix_now();
                let mut stats =
                    self.stats.lock().expect("stats lock poisoned");
                stats.current_input_id = Some(envelope.input_id.clone());
                stats.current_input_started_at = Some(started_at);
                stats.clock_running_since = Some(started_at);
            }

            return Ok(Some(PreparedInput {
                input_id: envelope.input_id,
                args,
            }));
        }
    }

    /// Stops the user-time clock. The driver calls this the moment the
    /// handler hands a value (or error) back, so the serialization and
    /// RPC work that follows is never billed as user time. Idempotent.
    pub fn pause_user_clock(&self) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        if let Some(since) = stats.clock_running_since.take() {
            stats.total_user_time += (unix_now() - since).max(0.0);
        }
    }

    /// Restarts the clock before control returns to user code, i.e. when
    /// a generator is about to be resumed for its next value.
    pub fn resume_user_clock(&self) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        if stats.current_input_id.is_some()
            && stats.clock_running_since.is_none()
        {
            stats.clock_running_since = Some(unix_now());
        }
    }

    /// Closes out the in-flight input: any still-running clock segment is
    /// accounted and the current-input fields clear regardless of handler
    /// outcome.
    pub fn finish_input(&self) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        if let Some(since) = stats.clock_running_since.take() {
            stats.total_user_time += (unix_now() - since).max(0.0);
        }
        stats.current_input_started_at = None;
        stats.current_input_id = None;
        stats.calls_completed += 1;
    }

    /// Starts the background output submitter. Call once before the
    /// input loop; pair with `close_outputs` after it.
    pub fn spawn_output_drain(
        &self,
    ) -> JoinHandle<Result<(), AgentError>> {
        let receiver = self
            .output_rx
            .lock()
            .expect("output queue lock poisoned")
            .take()
            .expect("output drain started twice");
        let client = self.client.clone();
        tokio::spawn(run_output_drain(client, receiver))
    }

    /// Flushes and joins the output drain within its grace period.
    pub async fn close_outputs(
        &self,
        handle: JoinHandle<Result<(), AgentError>>,
    ) -> Result<(), AgentError> {
        if self.output_tx.send(None).await.is_err() {
            warn!("output drain gone before close");
        }
        match timeout(OUTPUT_DRAIN_GRACE, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(AgentError::Internal(format!(
                "output drain task failed: {join_err}"
            ))),
            Err(_) => {
                warn!("output drain did not flush within grace period");
                Ok(())
            }
        }
    }

    pub async fn send_output(
        &self,
        input_id: &str,
        gen_index: u64,
        value: &Value,
    ) -> Result<(), AgentError> {
        let data = encode_value(value)?;
        let (data, data_blob_id) = self.offload_if_oversized(data).await?;
        let result = GenericResult {
            status: ResultStatus::Success,
            data,
            data_blob_id,
            gen_status: GenStatus::NotGenerator,
            exception: None,
            traceback: None,
            serialized_tb: None,
            tb_line_cache: None,
        };
        self.enqueue(input_id, gen_index, result).await
    }

    pub async fn send_generator_value(
        &self,
        input_id: &str,
        gen_index: u64,
        value: &Value,
    ) -> Result<(), AgentError> {
        let data = encode_value(value)?;
        let (data, data_blob_id) = self.offload_if_oversized(data).await?;
        let result = GenericResult {
            status: ResultStatus::Success,
            data,
            data_blob_id,
            gen_status: GenStatus::Incomplete,
            exception: None,
            traceback: None,
            serialized_tb: None,
            tb_line_cache: None,
        };
        self.enqueue(input_id, gen_index, result).await
    }

    pub async fn send_generator_eof(
        &self,
        input_id: &str,
        gen_index: u64,
    ) -> Result<(), AgentError> {
        let result = GenericResult {
            status: ResultStatus::Success,
            data: None,
            data_blob_id: None,
            gen_status: GenStatus::Complete,
            exception: None,
            traceback: None,
            serialized_tb: None,
            tb_line_cache: None,
        };
        self.enqueue(input_id, gen_index, result).await
    }

    /// Input-scoped failure funnel: the handler error becomes a FAILURE
    /// output for this input and the loop moves on.
    pub async fn report_input_failure(
        &self,
        input_id: &str,
        gen_index: u64,
        err: &HandlerError,
    ) -> Result<(), AgentError> {
        error!(
            "handler failed for input: input_id={}, error={}",
            input_id, err
        );
        let result = self.failure_result(err);
        self.enqueue(input_id, gen_index, result).await
    }

    /// User-scoped failure funnel: import or lifecycle failures mark the
    /// whole task failed via `task.result`, then surface the sentinel
    /// that exits the process without retry.
    pub async fn report_user_failure(
        &self,
        err: &HandlerError,
    ) -> AgentError {
        error!("user code failed outside input scope: error={}", err);
        let request = TaskResultRequest {
            task_id: self.task_id.clone(),
            result: self.failure_result(err),
        };
        if let Err(rpc_err) = self.client.task_result(&request).await {
            error!("failed to report task result: error={rpc_err}");
        }
        AgentError::UserCodeFailed
    }

    fn failure_result(&self, err: &HandlerError) -> GenericResult {
        let repr = err.repr();
        let (tb_payload, line_cache) = extract_traceback(&err.backtrace);
        let traceback = format_traceback(&tb_payload, &repr);

        // Both serializations are best-effort: the repr and text above
        // are always present even when the structured forms are not.
        let serialized_tb = tb_payload.encode().ok();
        let tb_line_cache =
            sprocket_proto::encode_line_cache(&line_cache).ok();
        let data = encode_exception(&sprocket_proto::ExceptionPayload {
            repr: repr.clone(),
            kind: Some(err.kind.clone()),
            detail: None,
        })
        .ok();

        GenericResult {
            status: ResultStatus::Failure,
            data,
            data_blob_id: None,
            gen_status: GenStatus::NotGenerator,
            exception: Some(repr),
            traceback: Some(traceback),
            serialized_tb,
            tb_line_cache,
        }
    }

    async fn offload_if_oversized(
        &self,
        data: Vec<u8>,
    ) -> Result<(Option<Vec<u8>>, Option<String>), AgentError> {
        if data.len() > MAX_OBJECT_SIZE_BYTES {
            let blob_id = self.blobs.upload(Bytes::from(data)).await?;
            Ok((None, Some(blob_id)))
        } else {
            Ok((Some(data), None))
        }
    }

    async fn enqueue(
        &self,
        input_id: &str,
        gen_index: u64,
        result: GenericResult,
    ) -> Result<(), AgentError> {
        let input_started_at = self
            .stats
            .lock()
            .expect("stats lock poisoned")
            .current_input_started_at;
        let record = OutputRecord {
            input_id: input_id.to_string(),
            input_started_at,
            output_created_at: unix_now(),
            gen_index,
            result,
        };
        self.output_tx.send(Some(record)).await.map_err(|_| {
            AgentError::Internal("output queue closed".to_string())
        })
    }
}

/// Drains the output queue in batches: a batch closes on the size
/// threshold, on a debounce window with nothing queued, or on the close
/// sentinel.
async fn run_output_drain(
    client: Arc<ControlClient>,
    mut receiver: mpsc::Receiver<Option<OutputRecord>>,
) -> Result<(), AgentError> {
    loop {
        let Some(first) = receiver.recv().await else {
            return Ok(());
        };
        let (batch, done) = collect_batch(&mut receiver, first).await;
        if !batch.is_empty() {
            client.put_outputs(batch).await?;
        }
        if done {
            return Ok(());
        }
    }
}

async fn collect_batch(
    receiver: &mut mpsc::Receiver<Option<OutputRecord>>,
    first: Option<OutputRecord>,
) -> (Vec<OutputRecord>, bool) {
    let mut batch = Vec::new();
    match first {
        None => return (batch, true),
        Some(record) => batch.push(record),
    }

    while batch.len() < OUTPUT_MAX_BATCH {
        match timeout(OUTPUT_DEBOUNCE, receiver.recv()).await {
            Err(_) => break,
            Ok(None) | Ok(Some(None)) => return (batch, true),
            Ok(Some(Some(record))) => batch.push(record),
        }
    }
    (batch, false)
}

pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// The id of the input currently being dispatched, visible to user code
/// for log stamping. Scoped per driver task (and per user thread for
/// sync handlers) so concurrent drivers in tests do not bleed into each
/// other.
pub mod current_input {
    use std::cell::RefCell;
    use std::future::Future;

    tokio::task_local! {
        static TASK_CURRENT: Option<String>;
    }

    thread_local! {
        static THREAD_CURRENT: RefCell<Option<String>> =
            const { RefCell::new(None) };
    }

    pub async fn scope<F: Future>(input_id: String, fut: F) -> F::Output {
        TASK_CURRENT.scope(Some(input_id), fut).await
    }

    pub fn get() -> Option<String> {
        if let Ok(Some(id)) = TASK_CURRENT.try_with(|id| id.clone()) {
            return Some(id);
        }
        THREAD_CURRENT.with(|cell| cell.borrow().clone())
    }

    /// RAII guard for the sync user thread; clears on drop.
    pub struct ThreadGuard;

    pub fn enter(input_id: String) -> ThreadGuard {
        THREAD_CURRENT.with(|cell| *cell.borrow_mut() = Some(input_id));
        ThreadGuard
    }

    impl Drop for ThreadGuard {
        fn drop(&mut self) {
            THREAD_CURRENT.with(|cell| *cell.borrow_mut() = None);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::Config;

    fn manager() -> FunctionIoManager {
        let config = Config {
            server_url: "127.0.0.1:1".to_string(),
            blob_url: "127.0.0.1:1".to_string(),
            token_id: None,
            token_secret: None,
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(1),
        };
        let container_args = ContainerArguments {
            task_id: "ta-1".to_string(),
            function_id: "fu-1".to_string(),
            app_id: "ap-1".to_string(),
            function_def: FunctionDef {
                module_name: "pkg.mod".to_string(),
                function_name: "run".to_string(),
                function_type: Default::default(),
                definition_type: Default::default(),
                webhook_config: Default::default(),
                pty_info: Default::default(),
            },
            proxy_info: None,
            tracing_context: Default::default(),
        };
        FunctionIoManager::new(
            &container_args,
            Arc::new(ControlClient::new(&config.server_url, &config)),
            Arc::new(BlobClient::new(
                &config.blob_url,
                config.connect_timeout,
            )),
            CancellationToken::new(),
        )
    }

    fn record(input_id: &str, gen_index: u64) -> OutputRecord {
        OutputRecord {
            input_id: input_id.to_string(),
            input_started_at: None,
            output_created_at: unix_now(),
            gen_index,
            result: GenericResult {
                status: ResultStatus::Success,
                data: None,
                data_blob_id: None,
                gen_status: GenStatus::Complete,
                exception: None,
                traceback: None,
                serialized_tb: None,
                tb_line_cache: None,
            },
        }
    }

    #[tokio::test]
    async fn batch_closes_on_sentinel_and_flushes_pending() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(Some(record("in-1", 0))).await.unwrap();
        tx.send(Some(record("in-2", 0))).await.unwrap();
        tx.send(None).await.unwrap();

        let first = rx.recv().await.unwrap();
        let (batch, done) = collect_batch(&mut rx, first).await;
        assert_eq!(batch.len(), 2);
        assert!(done);
    }

    #[tokio::test]
    async fn batch_closes_on_debounce_when_queue_runs_dry() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(Some(record("in-1", 0))).await.unwrap();

        let first = rx.recv().await.unwrap();
        let (batch, done) = collect_batch(&mut rx, first).await;
        assert_eq!(batch.len(), 1);
        assert!(!done);
    }

    #[tokio::test]
    async fn batches_may_mix_inputs() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(Some(record("in-1", 0))).await.unwrap();
        tx.send(Some(record("in-2", 0))).await.unwrap();

        let first = rx.recv().await.unwrap();
        let (batch, _done) = collect_batch(&mut rx, first).await;
        let ids: Vec<_> =
            batch.iter().map(|record| record.input_id.as_str()).collect();
        assert_eq!(ids, vec!["in-1", "in-2"]);
    }

    #[tokio::test]
    async fn user_clock_excludes_time_while_paused() {
        let io = manager();
        {
            let now = unix_now();
            let mut stats = io.stats.lock().unwrap();
            stats.current_input_id = Some("in-1".to_string());
            stats.current_input_started_at = Some(now);
            stats.clock_running_since = Some(now);
        }

        std::thread::sleep(Duration::from_millis(20));
        io.pause_user_clock();
        let after_pause = io.stats.lock().unwrap().total_user_time;
        assert!(after_pause > 0.0);

        // Time spent while paused (serialization, output RPCs) is free,
        // and a second pause accounts nothing.
        std::thread::sleep(Duration::from_millis(20));
        io.pause_user_clock();
        assert_eq!(io.stats.lock().unwrap().total_user_time, after_pause);

        io.resume_user_clock();
        std::thread::sleep(Duration::from_millis(20));
        io.finish_input();

        let stats = io.stats.lock().unwrap();
        assert!(stats.total_user_time > after_pause);
        assert!(stats.total_user_time < after_pause + 0.5);
        assert_eq!(stats.calls_completed, 1);
        assert!(stats.current_input_id.is_none());
        assert!(stats.current_input_started_at.is_none());
    }

    #[tokio::test]
    async fn resume_without_active_input_is_a_no_op() {
        let io = manager();
        io.resume_user_clock();
        std::thread::sleep(Duration::from_millis(10));
        io.pause_user_clock();
        assert_eq!(io.stats.lock().unwrap().total_user_time, 0.0);
    }

    #[tokio::test]
    async fn current_input_scopes_are_isolated_per_task() {
        let inner = current_input::scope("in-a".to_string(), async {
            assert_eq!(current_input::get().as_deref(), Some("in-a"));
        });
        inner.await;
        assert_eq!(current_input::get(), None);
    }

    #[test]
    fn thread_guard_clears_on_drop() {
        {
            let _guard = current_input::enter("in-t".to_string());
            assert_eq!(current_input::get().as_deref(), Some("in-t"));
        }
        assert_eq!(current_input::get(), None);
    }
}
