mod blob;
mod client;
mod dispatch;
mod heartbeat;
mod io;
mod pty;
mod registry;
mod traceback;
mod webhook;

pub use blob::BlobClient;
pub use client::{CallOptions, ControlClient, RpcError};
pub use dispatch::{call_function_async, call_function_sync, import_handler};
pub use heartbeat::run_heartbeat_loop;
pub use io::{
    FunctionIoManager, IoStats, MAX_OBJECT_SIZE_BYTES, PreparedInput,
    current_input,
};
pub use pty::{PtyShim, terminal_input};
pub use registry::{
    AppFactory, AppFn, AsyncFn, AsyncGenFn, AsyncHookFn, BoundInstance,
    ClassFactory, HandlerEntry, HandlerError, HandlerResult, HookFn,
    LifecycleHooks, RawHandler, Registry, SyncFn, SyncGenFn, SyncIter,
    global as global_registry,
};
pub use traceback::{extract_traceback, format_traceback};
pub use webhook::{WebhookRequest, WebhookResponse};

use sprocket_proto::PayloadError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("rpc failure: {0}")]
    Rpc(#[from] RpcError),
    #[error("payload codec failure: {0}")]
    Payload(#[from] PayloadError),
    /// User import or lifecycle code failed; the failure has already been
    /// reported through `task.result`, so the process exits without retry.
    #[error("user code failed")]
    UserCodeFailed,
    #[error("internal error: {0}")]
    Internal(String),
}
