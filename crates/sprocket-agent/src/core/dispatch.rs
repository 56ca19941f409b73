use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::StreamExt;
use sprocket_proto::{ArgsPayload, DefinitionType, FunctionType, HandlerSpec, WebhookKind};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::AgentError;
use super::io::{FunctionIoManager, PreparedInput, current_input};
use super::registry::{
    BoundInstance, HandlerEntry, HandlerError, HandlerResult,
    LifecycleHooks, RawHandler, Registry,
};
use super::webhook::{app_from_scalar, wrap_app};

/// A handler resolved, bound, wrapped, and classified — ready to drive.
pub struct LoadedHandler {
    pub handler: RawHandler,
    pub hooks: LifecycleHooks,
    pub is_async: bool,
    pub is_generator: bool,
}

/// Resolves the function definition into a runnable handler. Symbol and
/// user-construction failures go through the user funnel: the task is
/// marked failed and the returned error ends the process without retry.
pub async fn import_handler(
    io: &FunctionIoManager,
    registry: &Registry,
) -> Result<LoadedHandler, AgentError> {
    let function_def = io.function_def.clone();

    let (module_name, function_name) = match function_def.definition_type {
        DefinitionType::Inline => (
            function_def.module_name.clone(),
            function_def.function_name.clone(),
        ),
        DefinitionType::Serialized => {
            let response = io.client().get_serialized(&io.function_id).await?;
            let descriptor: HandlerSpec = match sprocket_proto::decode_value(
                &response.function_serialized,
            )
            .and_then(|value| {
                serde_json::from_value(value).map_err(|err| {
                    sprocket_proto::PayloadError::Decode(err.to_string())
                })
            }) {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    let err = HandlerError::new(
                        "SerializationError",
                        format!("handler descriptor decode failed: {err}"),
                    );
                    return Err(io.report_user_failure(&err).await);
                }
            };
            if response.class_serialized.is_some() {
                debug!(
                    "class descriptor present, resolution goes through the registry entry"
                );
            }
            (descriptor.module_name, descriptor.function_name)
        }
    };

    let Some(entry) = registry.resolve(&module_name, &function_name) else {
        let err = HandlerError::new(
            "ImportError",
            format!("handler {module_name}::{function_name} is not registered"),
        );
        return Err(io.report_user_failure(&err).await);
    };

    // Instantiate a class-bound handler; the zero-arg constructor is
    // user code, so panics funnel like any other user failure.
    let (handler, hooks) = match entry {
        HandlerEntry::Function(handler) => (handler, LifecycleHooks::default()),
        HandlerEntry::Class(factory) => {
            match catch_unwind(AssertUnwindSafe(|| factory())) {
                Ok(BoundInstance { handler, hooks }) => (handler, hooks),
                Err(payload) => {
                    let err = HandlerError::from_panic(payload);
                    return Err(io.report_user_failure(&err).await);
                }
            }
        }
        HandlerEntry::App(factory) => {
            match function_def.webhook_config.kind {
                WebhookKind::AsgiApp | WebhookKind::WsgiApp => {
                    let app = match catch_unwind(AssertUnwindSafe(|| {
                        factory()
                    })) {
                        Ok(app) => app,
                        Err(payload) => {
                            let err = HandlerError::from_panic(payload);
                            return Err(io.report_user_failure(&err).await);
                        }
                    };
                    return Ok(LoadedHandler {
                        handler: wrap_app(app),
                        hooks: LifecycleHooks::default(),
                        is_async: true,
                        is_generator: function_def.function_type
                            == FunctionType::Generator,
                    });
                }
                _ => {
                    let err = HandlerError::new(
                        "InvalidError",
                        format!(
                            "handler {module_name}::{function_name} is an app factory but the function is not a webhook app"
                        ),
                    );
                    return Err(io.report_user_failure(&err).await);
                }
            }
        }
    };

    let handler = match function_def.webhook_config.kind {
        WebhookKind::None => handler,
        WebhookKind::AsgiApp | WebhookKind::WsgiApp => {
            let err = HandlerError::new(
                "InvalidError",
                format!(
                    "webhook app for {module_name}::{function_name} must be registered as an app factory"
                ),
            );
            return Err(io.report_user_failure(&err).await);
        }
        WebhookKind::RawWebhook => {
            let method = function_def.webhook_config.method.clone();
            match app_from_scalar(&handler, method) {
                Ok(app) => wrap_app(app),
                Err(err) => {
                    return Err(io.report_user_failure(&err).await);
                }
            }
        }
    };

    let is_async = handler.is_async();
    Ok(LoadedHandler {
        handler,
        hooks,
        is_async,
        is_generator: function_def.function_type == FunctionType::Generator,
    })
}

/// Declared-type mismatch is reported per input, not at import: the input
/// gets a FAILURE output and the loop keeps going.
fn shape_mismatch(
    handler: &RawHandler,
    is_generator: bool,
) -> Option<HandlerError> {
    if is_generator == handler.is_generator_shaped() {
        return None;
    }
    let declared = if is_generator { "generator" } else { "scalar" };
    Some(HandlerError::new(
        "BadReturnType",
        format!(
            "function is declared {declared} but the handler is a {}",
            handler.shape_name()
        ),
    ))
}

enum InputOutcome {
    Completed,
    Failed { gen_index: u64, error: HandlerError },
}

// ---------------------------------------------------------------------------
// Sync driver: user code runs on a dedicated OS thread, the scheduler
// keeps the I/O; the two sides exchange jobs and events over channels.
// ---------------------------------------------------------------------------

enum UserJob {
    Enter,
    Exit,
    Call { input_id: String, args: ArgsPayload },
}

enum UserEvent {
    HookDone(Result<(), HandlerError>),
    ScalarDone(HandlerResult),
    Yielded(sprocket_proto::Value),
    GenDone(Result<(), HandlerError>),
}

fn user_thread_main(
    handler: RawHandler,
    hooks: LifecycleHooks,
    mut jobs: mpsc::Receiver<UserJob>,
    events: mpsc::Sender<UserEvent>,
) {
    while let Some(job) = jobs.blocking_recv() {
        match job {
            UserJob::Enter => {
                let result = run_sync_hook(hooks.enter.as_ref());
                if events.blocking_send(UserEvent::HookDone(result)).is_err() {
                    return;
                }
            }
            UserJob::Exit => {
                let result = run_sync_hook(hooks.exit.as_ref());
                if events.blocking_send(UserEvent::HookDone(result)).is_err() {
                    return;
                }
            }
            UserJob::Call { input_id, args } => {
                let _guard = current_input::enter(input_id);
                if run_sync_call(&handler, args, &events).is_err() {
                    return;
                }
            }
        }
    }
}

fn run_sync_hook(
    hook: Option<&super::registry::HookFn>,
) -> Result<(), HandlerError> {
    let Some(hook) = hook else {
        return Ok(());
    };
    catch_unwind(AssertUnwindSafe(|| hook()))
        .unwrap_or_else(|payload| Err(HandlerError::from_panic(payload)))
}

fn run_sync_call(
    handler: &RawHandler,
    args: ArgsPayload,
    events: &mpsc::Sender<UserEvent>,
) -> Result<(), ()> {
    match handler {
        RawHandler::Sync(fun) => {
            let result = catch_unwind(AssertUnwindSafe(|| fun(args)))
                .unwrap_or_else(|payload| {
                    Err(HandlerError::from_panic(payload))
                });
            events
                .blocking_send(UserEvent::ScalarDone(result))
                .map_err(|_| ())
        }
        RawHandler::SyncGen(fun) => {
            let iter = catch_unwind(AssertUnwindSafe(|| fun(args)))
                .unwrap_or_else(|payload| {
                    Err(HandlerError::from_panic(payload))
                });
            let mut iter = match iter {
                Ok(iter) => iter,
                Err(err) => {
                    return events
                        .blocking_send(UserEvent::GenDone(Err(err)))
                        .map_err(|_| ());
                }
            };
            loop {
                let item = catch_unwind(AssertUnwindSafe(|| iter.next()));
                let done = match item {
                    Err(payload) => {
                        UserEvent::GenDone(Err(HandlerError::from_panic(
                            payload,
                        )))
                    }
                    Ok(None) => UserEvent::GenDone(Ok(())),
                    Ok(Some(Err(err))) => UserEvent::GenDone(Err(err)),
                    Ok(Some(Ok(value))) => {
                        if events
                            .blocking_send(UserEvent::Yielded(value))
                            .is_err()
                        {
                            return Err(());
                        }
                        continue;
                    }
                };
                return events.blocking_send(done).map_err(|_| ());
            }
        }
        // The driver split guarantees sync shapes here.
        RawHandler::Async(_) | RawHandler::AsyncGen(_) => events
            .blocking_send(UserEvent::ScalarDone(Err(HandlerError::new(
                "InvalidError",
                "async handler routed to the sync driver",
            ))))
            .map_err(|_| ()),
    }
}

/// Drives a synchronous handler over the whole input feed.
pub async fn call_function_sync(
    io: &Arc<FunctionIoManager>,
    loaded: LoadedHandler,
) -> Result<(), AgentError> {
    if loaded.hooks.has_async_pair() && !loaded.hooks.has_sync_pair() {
        warn!("not running asynchronous enter/exit hooks with a sync handler");
    }

    let (jobs_tx, jobs_rx) = mpsc::channel::<UserJob>(1);
    let (events_tx, mut events_rx) = mpsc::channel::<UserEvent>(16);
    let handler = loaded.handler.clone();
    let hooks = loaded.hooks.clone();
    let user_thread = std::thread::Builder::new()
        .name("sprocket-user".to_string())
        .spawn(move || user_thread_main(handler, hooks, jobs_rx, events_tx))
        .map_err(|err| {
            AgentError::Internal(format!("failed to spawn user thread: {err}"))
        })?;

    if loaded.hooks.enter.is_some() {
        run_threaded_hook(io, &jobs_tx, &mut events_rx, UserJob::Enter)
            .await?;
    }

    let drain = io.spawn_output_drain();

    let loop_result = async {
        loop {
            let Some(prepared) = io.next_input().await? else {
                return Ok(());
            };
            let outcome = if let Some(error) =
                shape_mismatch(&loaded.handler, loaded.is_generator)
            {
                io.pause_user_clock();
                InputOutcome::Failed { gen_index: 0, error }
            } else {
                drive_threaded_input(io, &jobs_tx, &mut events_rx, &prepared)
                    .await?
            };
            if let InputOutcome::Failed { gen_index, error } = outcome {
                io.report_input_failure(&prepared.input_id, gen_index, &error)
                    .await?;
            }
            io.finish_input();
        }
    }
    .await;

    let hook_result = if loaded.hooks.exit.is_some() {
        run_threaded_hook(io, &jobs_tx, &mut events_rx, UserJob::Exit).await
    } else {
        Ok(())
    };

    let drain_result = io.close_outputs(drain).await;

    drop(jobs_tx);
    if user_thread.join().is_err() {
        warn!("user thread terminated abnormally");
    }

    loop_result.and(hook_result).and(drain_result)
}

async fn run_threaded_hook(
    io: &Arc<FunctionIoManager>,
    jobs: &mpsc::Sender<UserJob>,
    events: &mut mpsc::Receiver<UserEvent>,
    job: UserJob,
) -> Result<(), AgentError> {
    jobs.send(job).await.map_err(|_| user_thread_gone())?;
    match events.recv().await {
        Some(UserEvent::HookDone(Ok(()))) => Ok(()),
        Some(UserEvent::HookDone(Err(err))) => {
            Err(io.report_user_failure(&err).await)
        }
        Some(_) => Err(AgentError::Internal(
            "unexpected event while awaiting lifecycle hook".to_string(),
        )),
        None => Err(user_thread_gone()),
    }
}

async fn drive_threaded_input(
    io: &Arc<FunctionIoManager>,
    jobs: &mpsc::Sender<UserJob>,
    events: &mut mpsc::Receiver<UserEvent>,
    prepared: &PreparedInput,
) -> Result<InputOutcome, AgentError> {
    jobs.send(UserJob::Call {
        input_id: prepared.input_id.clone(),
        args: prepared.args.clone(),
    })
    .await
    .map_err(|_| user_thread_gone())?;

    let mut gen_index: u64 = 0;
    loop {
        match events.recv().await {
            Some(UserEvent::ScalarDone(Ok(value))) => {
                io.pause_user_clock();
                io.send_output(&prepared.input_id, gen_index, &value).await?;
                return Ok(InputOutcome::Completed);
            }
            Some(UserEvent::ScalarDone(Err(error))) => {
                io.pause_user_clock();
                return Ok(InputOutcome::Failed { gen_index, error });
            }
            Some(UserEvent::Yielded(value)) => {
                io.pause_user_clock();
                io.send_generator_value(&prepared.input_id, gen_index, &value)
                    .await?;
                gen_index += 1;
                io.resume_user_clock();
            }
            Some(UserEvent::GenDone(Ok(()))) => {
                io.pause_user_clock();
                io.send_generator_eof(&prepared.input_id, gen_index).await?;
                return Ok(InputOutcome::Completed);
            }
            Some(UserEvent::GenDone(Err(error))) => {
                io.pause_user_clock();
                return Ok(InputOutcome::Failed { gen_index, error });
            }
            Some(UserEvent::HookDone(_)) => {
                return Err(AgentError::Internal(
                    "unexpected hook event during input".to_string(),
                ));
            }
            None => return Err(user_thread_gone()),
        }
    }
}

fn user_thread_gone() -> AgentError {
    AgentError::Internal("user thread exited unexpectedly".to_string())
}

// ---------------------------------------------------------------------------
// Async driver: user code shares the cooperative scheduler.
// ---------------------------------------------------------------------------

/// Drives an asynchronous handler over the whole input feed.
pub async fn call_function_async(
    io: &Arc<FunctionIoManager>,
    loaded: LoadedHandler,
) -> Result<(), AgentError> {
    let use_async_hooks = loaded.hooks.has_async_pair();
    if loaded.hooks.has_sync_pair() && use_async_hooks {
        debug!("class defines both hook pairs, preferring the async pair");
    }

    if let Err(err) =
        run_async_hook(&loaded.hooks, use_async_hooks, HookSlot::Enter).await
    {
        return Err(io.report_user_failure(&err).await);
    }

    let drain = io.spawn_output_drain();

    let loop_result = async {
        loop {
            let Some(prepared) = io.next_input().await? else {
                return Ok(());
            };
            let outcome = if let Some(error) =
                shape_mismatch(&loaded.handler, loaded.is_generator)
            {
                io.pause_user_clock();
                InputOutcome::Failed { gen_index: 0, error }
            } else {
                drive_async_input(io, &loaded.handler, &prepared).await?
            };
            if let InputOutcome::Failed { gen_index, error } = outcome {
                io.report_input_failure(&prepared.input_id, gen_index, &error)
                    .await?;
            }
            io.finish_input();
        }
    }
    .await;

    let hook_result = match run_async_hook(
        &loaded.hooks,
        use_async_hooks,
        HookSlot::Exit,
    )
    .await
    {
        Ok(()) => Ok(()),
        Err(err) => Err(io.report_user_failure(&err).await),
    };

    let drain_result = io.close_outputs(drain).await;

    loop_result.and(hook_result).and(drain_result)
}

enum HookSlot {
    Enter,
    Exit,
}

async fn run_async_hook(
    hooks: &LifecycleHooks,
    prefer_async: bool,
    slot: HookSlot,
) -> Result<(), HandlerError> {
    if prefer_async {
        let hook = match slot {
            HookSlot::Enter => hooks.enter_async.as_ref(),
            HookSlot::Exit => hooks.exit_async.as_ref(),
        };
        let Some(hook) = hook else {
            return Ok(());
        };
        return AssertUnwindSafe(hook())
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(HandlerError::from_panic(payload)));
    }

    let hook = match slot {
        HookSlot::Enter => hooks.enter.as_ref(),
        HookSlot::Exit => hooks.exit.as_ref(),
    };
    run_sync_hook(hook)
}

async fn drive_async_input(
    io: &Arc<FunctionIoManager>,
    handler: &RawHandler,
    prepared: &PreparedInput,
) -> Result<InputOutcome, AgentError> {
    let input_id = prepared.input_id.clone();
    let args = prepared.args.clone();
    let mut gen_index: u64 = 0;

    match handler {
        RawHandler::Async(fun) => {
            let fun = fun.clone();
            let result = current_input::scope(input_id.clone(), async move {
                AssertUnwindSafe(fun(args)).catch_unwind().await
            })
            .await
            .unwrap_or_else(|payload| Err(HandlerError::from_panic(payload)));
            io.pause_user_clock();
            match result {
                Ok(value) => {
                    io.send_output(&input_id, gen_index, &value).await?;
                    Ok(InputOutcome::Completed)
                }
                Err(error) => Ok(InputOutcome::Failed { gen_index, error }),
            }
        }
        RawHandler::AsyncGen(fun) => {
            let fun = fun.clone();
            let outcome = current_input::scope(input_id.clone(), async {
                let mut stream = fun(args);
                loop {
                    let item = AssertUnwindSafe(stream.next())
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|payload| {
                            Some(Err(HandlerError::from_panic(payload)))
                        });
                    io.pause_user_clock();
                    match item {
                        None => {
                            io.send_generator_eof(&input_id, gen_index)
                                .await?;
                            return Ok(InputOutcome::Completed);
                        }
                        Some(Ok(value)) => {
                            io.send_generator_value(
                                &input_id, gen_index, &value,
                            )
                            .await?;
                            gen_index += 1;
                            io.resume_user_clock();
                        }
                        Some(Err(error)) => {
                            return Ok(InputOutcome::Failed {
                                gen_index,
                                error,
                            });
                        }
                    }
                }
            })
            .await;
            outcome
        }
        RawHandler::Sync(_) | RawHandler::SyncGen(_) => {
            Err(AgentError::Internal(
                "sync handler routed to the async driver".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sprocket_proto::{
        ContainerArguments, FunctionDef, FunctionType, WebhookConfig,
        WebhookKind,
    };
    use tokio_util::sync::CancellationToken;

    use super::super::blob::BlobClient;
    use super::super::client::ControlClient;
    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        Config {
            server_url: "127.0.0.1:1".to_string(),
            blob_url: "127.0.0.1:1".to_string(),
            token_id: None,
            token_secret: None,
            heartbeat_interval: std::time::Duration::from_secs(15),
            heartbeat_timeout: std::time::Duration::from_secs(10),
            connect_timeout: std::time::Duration::from_secs(1),
        }
    }

    fn manager_for(function_def: FunctionDef) -> FunctionIoManager {
        let config = test_config();
        let container_args = ContainerArguments {
            task_id: "ta-1".to_string(),
            function_id: "fu-1".to_string(),
            app_id: "ap-1".to_string(),
            function_def,
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

    fn scalar_def(module_name: &str, function_name: &str) -> FunctionDef {
        FunctionDef {
            module_name: module_name.to_string(),
            function_name: function_name.to_string(),
            function_type: FunctionType::Scalar,
            definition_type: DefinitionType::Inline,
            webhook_config: WebhookConfig::default(),
            pty_info: Default::default(),
        }
    }

    #[tokio::test]
    async fn import_resolves_inline_handler() {
        let registry = Registry::new();
        registry.register_sync(
            "pkg.mod",
            "incr",
            Arc::new(|payload| {
                Ok(json!(payload.args[0].as_i64().unwrap_or(0) + 1))
            }),
        );
        let io = manager_for(scalar_def("pkg.mod", "incr"));
        let loaded = import_handler(&io, &registry).await.unwrap();
        assert!(!loaded.is_async);
        assert!(!loaded.is_generator);
    }

    #[tokio::test]
    async fn raw_webhook_wrapping_forces_async() {
        let registry = Registry::new();
        registry.register_sync("pkg.mod", "hook", Arc::new(|_| Ok(json!(1))));
        let mut function_def = scalar_def("pkg.mod", "hook");
        function_def.webhook_config = WebhookConfig {
            kind: WebhookKind::RawWebhook,
            method: Some("POST".to_string()),
        };
        let io = manager_for(function_def);
        let loaded = import_handler(&io, &registry).await.unwrap();
        assert!(loaded.is_async);
        assert!(matches!(loaded.handler, RawHandler::Async(_)));
    }

    #[test]
    fn mismatched_shape_is_a_bad_return_type() {
        let handler = RawHandler::Sync(Arc::new(|_| Ok(json!(null))));
        let err = shape_mismatch(&handler, true).unwrap();
        assert_eq!(err.kind, "BadReturnType");
        assert!(shape_mismatch(&handler, false).is_none());
    }
}
