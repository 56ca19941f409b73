pub mod config;
pub mod core;

use std::sync::Arc;
use std::time::Duration;

use sprocket_proto::ContainerArguments;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
pub use crate::core::AgentError;
use crate::core::{
    BlobClient, ControlClient, FunctionIoManager, PtyShim, Registry,
    call_function_async, call_function_sync, import_handler,
    run_heartbeat_loop,
};

const HEARTBEAT_STOP_GRACE: Duration = Duration::from_secs(1);

/// Runs the container agent to completion: heartbeats in one task, the
/// input/output driver in the other. Returns cleanly on EOF, kill switch,
/// or signal cancellation; `AgentError::UserCodeFailed` marks a fatal
/// user-code failure already reported to the control plane.
pub async fn run_container(
    container_args: ContainerArguments,
    config: Config,
    registry: &Registry,
    shutdown: CancellationToken,
) -> Result<(), AgentError> {
    let client = Arc::new(ControlClient::new(&config.server_url, &config));
    let blobs =
        Arc::new(BlobClient::new(&config.blob_url, config.connect_timeout));
    let io = Arc::new(FunctionIoManager::new(
        &container_args,
        client.clone(),
        blobs,
        shutdown.clone(),
    ));

    info!(
        "container starting: task_id={}, function_id={}, app_id={}",
        io.task_id, io.function_id, io.app_id
    );
    if let Some(proxy) = &container_args.proxy_info {
        debug!(
            "proxy configured: host={}, port={}",
            proxy.host, proxy.port
        );
    }
    if !container_args.tracing_context.is_empty() {
        debug!(
            "tracing context received: entries={}",
            container_args.tracing_context.len()
        );
    }

    let heartbeat_shutdown = shutdown.child_token();
    let heartbeat = tokio::spawn(run_heartbeat_loop(
        client.clone(),
        io.task_id.clone(),
        io.stats_handle(),
        config.heartbeat_interval,
        heartbeat_shutdown.clone(),
    ));

    let result = drive(&io, registry, &container_args, &shutdown).await;

    heartbeat_shutdown.cancel();
    if tokio::time::timeout(HEARTBEAT_STOP_GRACE, heartbeat).await.is_err() {
        warn!("heartbeat loop did not stop within grace period");
    }

    info!("container done: task_id={}", io.task_id);
    result
}

async fn drive(
    io: &Arc<FunctionIoManager>,
    registry: &Registry,
    container_args: &ContainerArguments,
    shutdown: &CancellationToken,
) -> Result<(), AgentError> {
    let loaded = import_handler(io, registry).await?;

    let pty_shim = if container_args.function_def.pty_info.enabled {
        Some(
            PtyShim::start(
                io.client(),
                &io.task_id,
                &container_args.function_def.pty_info,
            )
            .await?,
        )
    } else {
        None
    };

    let io_for_driver = io.clone();
    let driver = async move {
        if loaded.is_async {
            call_function_async(&io_for_driver, loaded).await
        } else {
            call_function_sync(&io_for_driver, loaded).await
        }
    };

    // SIGINT/SIGTERM cancel the driver task; the cancellation is
    // swallowed here so a signal never reads as a crash. In-flight
    // inputs emit nothing, the server treats them as timeouts.
    let result = tokio::select! {
        _ = shutdown.cancelled() => {
            info!("driver cancelled by shutdown signal");
            Ok(())
        }
        result = driver => result,
    };

    if let Some(shim) = pty_shim {
        shim.stop().await;
    }
    result
}
