use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use sprocket_proto::{ArgsPayload, Value};

/// Failure raised by user handler code. Carries enough to render a useful
/// trace on the caller's side even when the container's sources are gone.
#[derive(Debug)]
pub struct HandlerError {
    pub kind: String,
    pub message: String,
    pub backtrace: backtrace::Backtrace,
}

impl HandlerError {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
            backtrace: backtrace::Backtrace::new(),
        }
    }

    /// Canonical printable form, e.g. `ValueError("nope")`.
    pub fn repr(&self) -> String {
        format!("{}({:?})", self.kind, self.message)
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        Self::new("Panic", message)
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for HandlerError {}

pub type HandlerResult = Result<Value, HandlerError>;
pub type SyncFn = Arc<dyn Fn(ArgsPayload) -> HandlerResult + Send + Sync>;
pub type SyncIter = Box<dyn Iterator<Item = HandlerResult> + Send>;
pub type SyncGenFn =
    Arc<dyn Fn(ArgsPayload) -> Result<SyncIter, HandlerError> + Send + Sync>;
pub type AsyncFn = Arc<
    dyn Fn(ArgsPayload) -> BoxFuture<'static, HandlerResult> + Send + Sync,
>;
pub type AsyncGenFn = Arc<
    dyn Fn(ArgsPayload) -> BoxStream<'static, HandlerResult> + Send + Sync,
>;
pub type HookFn = Arc<dyn Fn() -> Result<(), HandlerError> + Send + Sync>;
pub type AsyncHookFn = Arc<
    dyn Fn() -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync,
>;

/// The callable stripped of any platform wrapper, tagged by shape. The
/// declared function type is validated against this shape at dispatch.
#[derive(Clone)]
pub enum RawHandler {
    Sync(SyncFn),
    SyncGen(SyncGenFn),
    Async(AsyncFn),
    AsyncGen(AsyncGenFn),
}

impl RawHandler {
    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_) | Self::AsyncGen(_))
    }

    pub fn is_generator_shaped(&self) -> bool {
        matches!(self, Self::SyncGen(_) | Self::AsyncGen(_))
    }

    pub fn shape_name(&self) -> &'static str {
        match self {
            Self::Sync(_) => "sync function",
            Self::SyncGen(_) => "sync generator",
            Self::Async(_) => "async function",
            Self::AsyncGen(_) => "async generator",
        }
    }
}

/// Pre-run / post-run hooks of a class-bound handler. A field left `None`
/// means the class does not define that hook.
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    pub enter: Option<HookFn>,
    pub exit: Option<HookFn>,
    pub enter_async: Option<AsyncHookFn>,
    pub exit_async: Option<AsyncHookFn>,
}

impl LifecycleHooks {
    pub fn has_sync_pair(&self) -> bool {
        self.enter.is_some() || self.exit.is_some()
    }

    pub fn has_async_pair(&self) -> bool {
        self.enter_async.is_some() || self.exit_async.is_some()
    }
}

/// A class instance with its handler already bound to it: the closures
/// capture the instance state, the registry never does.
pub struct BoundInstance {
    pub handler: RawHandler,
    pub hooks: LifecycleHooks,
}

pub type ClassFactory = Arc<dyn Fn() -> BoundInstance + Send + Sync>;

/// Webhook app callable: full request value in, response value out.
pub type AppFn = Arc<
    dyn Fn(Value) -> BoxFuture<'static, Result<Value, HandlerError>>
        + Send
        + Sync,
>;
pub type AppFactory = Arc<dyn Fn() -> AppFn + Send + Sync>;

/// What a registered symbol resolves to.
#[derive(Clone)]
pub enum HandlerEntry {
    /// A free function.
    Function(RawHandler),
    /// A class with a zero-arg constructor; instantiation binds the
    /// handler and exposes lifecycle hooks.
    Class(ClassFactory),
    /// A factory returning a webhook application.
    App(AppFactory),
}

/// Handler registry keyed by `module::function`. Entries are linked into
/// the agent binary and registered before the driver starts.
#[derive(Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, HandlerEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        module_name: &str,
        function_name: &str,
        entry: HandlerEntry,
    ) {
        let key = entry_key(module_name, function_name);
        self.entries
            .write()
            .expect("registry lock poisoned")
            .insert(key, entry);
    }

    pub fn register_sync(
        &self,
        module_name: &str,
        function_name: &str,
        handler: SyncFn,
    ) {
        self.register(
            module_name,
            function_name,
            HandlerEntry::Function(RawHandler::Sync(handler)),
        );
    }

    pub fn register_async(
        &self,
        module_name: &str,
        function_name: &str,
        handler: AsyncFn,
    ) {
        self.register(
            module_name,
            function_name,
            HandlerEntry::Function(RawHandler::Async(handler)),
        );
    }

    pub fn resolve(
        &self,
        module_name: &str,
        function_name: &str,
    ) -> Option<HandlerEntry> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(&entry_key(module_name, function_name))
            .cloned()
    }
}

fn entry_key(module_name: &str, function_name: &str) -> String {
    format!("{module_name}::{function_name}")
}

/// Process-wide registry the binary links user handlers into.
pub fn global() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn resolves_registered_function() {
        let registry = Registry::new();
        registry.register_sync(
            "pkg.mod",
            "double",
            Arc::new(|payload| {
                let x = payload.args[0].as_i64().unwrap_or(0);
                Ok(json!(x * 2))
            }),
        );

        let entry = registry.resolve("pkg.mod", "double").unwrap();
        let HandlerEntry::Function(RawHandler::Sync(fun)) = entry else {
            panic!("wrong entry shape");
        };
        let payload = ArgsPayload {
            args: vec![json!(21)],
            kwargs: Default::default(),
        };
        assert_eq!(fun(payload).unwrap(), json!(42));
    }

    #[test]
    fn unknown_symbol_resolves_to_none() {
        let registry = Registry::new();
        assert!(registry.resolve("pkg.mod", "missing").is_none());
    }

    #[test]
    fn handler_error_repr_names_the_kind() {
        let err = HandlerError::new("ValueError", "nope");
        assert_eq!(err.repr(), "ValueError(\"nope\")");
    }
}
