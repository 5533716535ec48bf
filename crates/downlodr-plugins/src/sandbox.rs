//! WASM sandbox execution via wasmtime
//!
//! A plugin module sees nothing but its import table. Four import modules
//! are resolvable: `log`, `timers`, `path`, and the capability module
//! `downlodr`, whose single `call` function routes a JSON request to the
//! plugin's [`PluginApi`]. Results come back through the guest's
//! `on_callback(token, ptr, len)` export, in memory obtained from its
//! `alloc(len)` export.

use crate::{
    PluginError, PluginResult,
    api::{
        FormatHandlerSpec, NotificationOptions, PluginApi, SaveDialogOptions, WriteFileRequest,
    },
    handlers::{Handler, handler},
    loader::{Evaluator, PluginExports},
    registry::ItemContext,
    store::PluginCode,
    ui::{DirectoryPickerOptions, FormatSelectorOptions, ModalOptions, SidePanelOptions},
};
use anyhow::Context as _;
use async_trait::async_trait;
use downlodr_core::{config::SandboxConfig, downloads::DownloadOptions};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use std::{
    collections::HashMap,
    future::Future,
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak, mpsc},
    thread,
    time::Duration,
};
use tokio::{runtime::Handle, task::AbortHandle};
use tracing::{debug, error, info, warn};
use wasmtime::{
    AsContext, AsContextMut, Caller, Config, Engine, ExternType, Instance, Linker, Memory, Module,
    Store, StoreLimits, StoreLimitsBuilder, TypedFunc, WasmBacktraceDetails,
};

/// Import modules a plugin may link against
pub const ALLOWED_IMPORT_MODULES: [&str; 4] = ["log", "timers", "path", "downlodr"];

/// Return codes of `downlodr.call`
pub mod status {
    pub const OK: i32 = 0;
    pub const MALFORMED: i32 = -1;
    pub const UNKNOWN_METHOD: i32 = -2;
    pub const DENIED: i32 = -3;
}

#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub fuel: u64,
    pub memory_bytes: usize,
    pub table_elements: usize,
    pub instances: usize,
    pub execution_timeout: Duration,
    pub max_module_bytes: usize,
}

impl From<&SandboxConfig> for SandboxLimits {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            fuel: config.fuel_limit,
            memory_bytes: config.memory_limit_bytes,
            table_elements: 1_024,
            instances: 16,
            execution_timeout: Duration::from_millis(config.execution_timeout_ms),
            max_module_bytes: config.max_module_bytes,
        }
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self::from(&SandboxConfig::default())
    }
}

/// Engine and limits for one plugin. Each plugin gets its own engine so an
/// expired deadline only interrupts that plugin.
pub struct Sandbox {
    engine: Engine,
    limits: SandboxLimits,
}

impl Sandbox {
    pub fn new(limits: SandboxLimits) -> PluginResult<Self> {
        if limits.fuel == 0 {
            return Err(PluginError::ValidationFailed(
                "Fuel limit must be greater than zero".to_string(),
            ));
        }

        let mut config = Config::new();
        config.consume_fuel(true);
        config.wasm_threads(false);
        config.async_support(false);
        config.epoch_interruption(true);
        config.wasm_backtrace_details(WasmBacktraceDetails::Disable);

        let engine = Engine::new(&config).map_err(|e| {
            PluginError::WasmError(format!("Failed to initialize wasmtime engine: {e}"))
        })?;

        Ok(Self { engine, limits })
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Compile a module (binary or text format) and check its imports
    pub fn compile(&self, plugin_id: &str, code: &[u8]) -> PluginResult<Module> {
        let load_failed = |reason: String| PluginError::LoadFailed {
            plugin_id: plugin_id.to_string(),
            reason,
        };

        if code.len() > self.limits.max_module_bytes {
            return Err(load_failed(format!(
                "module too large: {} bytes (limit {})",
                code.len(),
                self.limits.max_module_bytes
            )));
        }

        let module = Module::new(&self.engine, code)
            .map_err(|e| load_failed(format!("invalid module: {e}")))?;

        for import in module.imports() {
            if !ALLOWED_IMPORT_MODULES.contains(&import.module()) {
                return Err(load_failed(format!(
                    "import '{}.{}': module '{}' is not allowed",
                    import.module(),
                    import.name(),
                    import.module()
                )));
            }
        }

        Ok(module)
    }

    /// Does the module export the `initialize` entry point?
    pub fn exports_initialize(module: &Module) -> bool {
        module
            .exports()
            .any(|export| export.name() == "initialize" && matches!(export.ty(), ExternType::Func(_)))
    }
}

/// Turns fetched plugin code into a sandboxed [`WasmPlugin`]
pub struct WasmEvaluator {
    limits: SandboxLimits,
}

impl WasmEvaluator {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }
}

#[async_trait]
impl Evaluator for WasmEvaluator {
    async fn evaluate(
        &self,
        plugin_id: &str,
        code: PluginCode,
    ) -> PluginResult<Option<Arc<dyn PluginExports>>> {
        let limits = self.limits.clone();
        let id = plugin_id.to_string();

        let compiled = tokio::task::spawn_blocking(move || {
            let sandbox = Sandbox::new(limits)?;
            let module = sandbox.compile(&id, &code.code)?;
            Ok::<_, PluginError>((sandbox, module))
        })
        .await
        .map_err(|e| PluginError::WasmError(e.to_string()))??;

        let (sandbox, module) = compiled;
        if !Sandbox::exports_initialize(&module) {
            return Ok(None);
        }

        Ok(Some(Arc::new(WasmPlugin {
            plugin_id: plugin_id.to_string(),
            sandbox,
            module,
            live: Mutex::new(None),
        })))
    }
}

type SharedInstance = Arc<Mutex<WasmInstance>>;

/// A compiled plugin module; instantiated on `initialize`
pub struct WasmPlugin {
    plugin_id: String,
    sandbox: Sandbox,
    module: Module,
    live: Mutex<Option<SharedInstance>>,
}

impl WasmPlugin {
    fn live(&self) -> MutexGuard<'_, Option<SharedInstance>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PluginExports for WasmPlugin {
    async fn initialize(&self, api: PluginApi) -> PluginResult<()> {
        let engine = self.sandbox.engine.clone();
        let limits = self.sandbox.limits.clone();
        let module = self.module.clone();
        let plugin_id = self.plugin_id.clone();
        let runtime = Handle::current();

        let shared = tokio::task::spawn_blocking(move || {
            WasmInstance::start(engine, limits, &module, plugin_id, api, runtime)
        })
        .await
        .map_err(|e| PluginError::WasmError(e.to_string()))??;

        if let Some(previous) = self.live().replace(shared) {
            lock(&previous).shutdown_quietly();
        }
        Ok(())
    }

    async fn on_unload(&self) -> PluginResult<()> {
        let Some(shared) = self.live().take() else {
            return Ok(());
        };

        tokio::task::spawn_blocking(move || lock(&shared).shutdown())
            .await
            .map_err(|e| PluginError::WasmError(e.to_string()))?
    }
}

#[derive(Clone)]
struct GuestExports {
    memory: Option<Memory>,
    alloc: Option<TypedFunc<i32, i32>>,
    on_callback: Option<TypedFunc<(i32, i32, i32), ()>>,
    on_unload: Option<TypedFunc<(), ()>>,
}

impl GuestExports {
    fn resolve(store: &mut Store<GuestState>, instance: &Instance) -> Self {
        Self {
            memory: instance.get_memory(&mut *store, "memory"),
            alloc: instance.get_typed_func(&mut *store, "alloc").ok(),
            on_callback: instance.get_typed_func(&mut *store, "on_callback").ok(),
            on_unload: instance.get_typed_func(&mut *store, "on_unload").ok(),
        }
    }
}

struct GuestState {
    plugin_id: String,
    api: PluginApi,
    runtime: Handle,
    limits: StoreLimits,
    exports: Option<GuestExports>,
    instance: Weak<Mutex<WasmInstance>>,
    timers: HashMap<i32, AbortHandle>,
    next_timer: i32,
    unloaded: bool,
}

struct WasmInstance {
    store: Store<GuestState>,
    engine: Engine,
    limits: SandboxLimits,
}

fn lock(shared: &SharedInstance) -> MutexGuard<'_, WasmInstance> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WasmInstance {
    /// Instantiate the module and run its `initialize` export
    fn start(
        engine: Engine,
        limits: SandboxLimits,
        module: &Module,
        plugin_id: String,
        api: PluginApi,
        runtime: Handle,
    ) -> PluginResult<SharedInstance> {
        let load_failed = |reason: String| PluginError::LoadFailed {
            plugin_id: plugin_id.clone(),
            reason,
        };

        let mut linker = Linker::new(&engine);
        define_host_functions(&mut linker).map_err(|e| load_failed(e.to_string()))?;
        linker
            .define_unknown_imports_as_traps(module)
            .map_err(|e| load_failed(e.to_string()))?;

        let mut store = Store::new(
            &engine,
            GuestState {
                plugin_id: plugin_id.clone(),
                api,
                runtime,
                limits: StoreLimitsBuilder::new()
                    .memory_size(limits.memory_bytes)
                    .table_elements(limits.table_elements)
                    .instances(limits.instances)
                    .trap_on_grow_failure(true)
                    .build(),
                exports: None,
                instance: Weak::new(),
                timers: HashMap::new(),
                next_timer: 0,
                unloaded: false,
            },
        );
        store.limiter(|state| &mut state.limits);

        let instance = arm(&mut store, &engine, &limits, |store| {
            linker.instantiate(&mut *store, module)
        })
        .map_err(|e| load_failed(format!("instantiation failed: {e:#}")))?;

        let exports = GuestExports::resolve(&mut store, &instance);
        store.data_mut().exports = Some(exports);
        let initialize = instance
            .get_typed_func::<(), i32>(&mut store, "initialize")
            .map_err(|e| load_failed(e.to_string()))?;

        let shared = Arc::new(Mutex::new(WasmInstance {
            store,
            engine,
            limits,
        }));

        let mut guard = lock(&shared);
        guard.store.data_mut().instance = Arc::downgrade(&shared);

        let initialized = guard.enter(|store| initialize.call(&mut *store, ()));
        let failure = match initialized {
            Ok(0) => None,
            Ok(code) => Some(format!("initialize returned {code}")),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = failure {
            guard.shutdown_quietly();
            return Err(PluginError::InitializationFailed { plugin_id, reason });
        }

        drop(guard);
        Ok(shared)
    }

    /// Run guest code with a fresh fuel budget and wall-clock deadline
    fn enter<R>(
        &mut self,
        f: impl FnOnce(&mut Store<GuestState>) -> wasmtime::Result<R>,
    ) -> PluginResult<R> {
        arm(&mut self.store, &self.engine, &self.limits, f)
            .map_err(|e| PluginError::WasmError(format!("{e:#}")))
    }

    fn callback(&mut self, token: i32, payload: &str) -> PluginResult<()> {
        if self.store.data().unloaded {
            return Ok(());
        }
        self.enter(|store| deliver(&mut *store, token, payload))
    }

    /// Call `on_unload` if exported, then stop timers and callbacks
    fn shutdown(&mut self) -> PluginResult<()> {
        if self.store.data().unloaded {
            return Ok(());
        }
        let on_unload = self
            .store
            .data()
            .exports
            .as_ref()
            .and_then(|exports| exports.on_unload.clone());
        let result = match on_unload {
            Some(on_unload) => self.enter(|store| on_unload.call(&mut *store, ())),
            None => Ok(()),
        };
        self.shutdown_quietly();
        result
    }

    fn shutdown_quietly(&mut self) {
        let state = self.store.data_mut();
        state.unloaded = true;
        for (_, timer) in state.timers.drain() {
            timer.abort();
        }
        debug!(plugin_id = %state.plugin_id, "Sandbox instance stopped");
    }
}

fn arm<R>(
    store: &mut Store<GuestState>,
    engine: &Engine,
    limits: &SandboxLimits,
    f: impl FnOnce(&mut Store<GuestState>) -> wasmtime::Result<R>,
) -> wasmtime::Result<R> {
    store.set_fuel(limits.fuel)?;
    // Enforce wall-clock timeout using epoch interruption
    store.set_epoch_deadline(1);

    let watchdog = Watchdog::start(engine, limits.execution_timeout);
    let result = f(store);
    drop(watchdog);
    result
}

/// Bumps the engine epoch unless dropped before the timeout
struct Watchdog {
    cancel: Option<mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Watchdog {
    fn start(engine: &Engine, timeout: Duration) -> Self {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let engine = engine.clone();
        let thread = thread::spawn(move || {
            if let Err(mpsc::RecvTimeoutError::Timeout) = cancelled.recv_timeout(timeout) {
                engine.increment_epoch();
            }
        });
        Self {
            cancel: Some(cancel),
            thread: Some(thread),
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Write `payload` into guest memory and call `on_callback(token, ptr, len)`
fn deliver(mut ctx: impl AsContextMut<Data = GuestState>, token: i32, payload: &str) -> anyhow::Result<()> {
    let Some(exports) = ctx.as_context().data().exports.clone() else {
        return Ok(());
    };
    let Some(on_callback) = exports.on_callback else {
        debug!(token, "Guest has no on_callback export; result dropped");
        return Ok(());
    };

    let bytes = payload.as_bytes();
    let (ptr, len) = match (exports.alloc, exports.memory) {
        (Some(alloc), Some(memory)) if !bytes.is_empty() => {
            let len = i32::try_from(bytes.len()).context("callback payload too large")?;
            let ptr = alloc.call(&mut ctx, len)?;
            memory.write(&mut ctx, ptr as u32 as usize, bytes)?;
            (ptr, len)
        }
        _ => (0, 0),
    };

    on_callback.call(&mut ctx, (token, ptr, len))
}

/// Deliver a result outside of any guest call
async fn deliver_later(guest: Weak<Mutex<WasmInstance>>, token: i32, payload: String) {
    let delivered = tokio::task::spawn_blocking(move || {
        let Some(shared) = guest.upgrade() else {
            return Ok(());
        };
        let mut instance = lock(&shared);
        instance.callback(token, &payload)
    })
    .await;

    match delivered {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(token, error = %e, "Plugin callback failed"),
        Err(e) => error!(token, error = %e, "Plugin callback task failed"),
    }
}

/// Read a string from WASM memory
fn read_string(caller: &mut Caller<'_, GuestState>, ptr: i32, len: i32) -> anyhow::Result<String> {
    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| anyhow::anyhow!("Plugin has no memory export"))?;

    let data = memory.data(&*caller);
    let start = ptr as u32 as usize;
    let end = start
        .checked_add(len as u32 as usize)
        .ok_or_else(|| anyhow::anyhow!("Memory access out of bounds"))?;

    let bytes = data
        .get(start..end)
        .ok_or_else(|| anyhow::anyhow!("Memory access out of bounds"))?;
    String::from_utf8(bytes.to_vec()).context("Invalid UTF-8 in string")
}

fn define_host_functions(linker: &mut Linker<GuestState>) -> anyhow::Result<()> {
    linker.func_wrap(
        "log",
        "log",
        |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| {
            if let Ok(message) = read_string(&mut caller, ptr, len) {
                info!(target: "downlodr::plugin", plugin_id = %caller.data().plugin_id, "{message}");
            }
        },
    )?;

    linker.func_wrap(
        "log",
        "warn",
        |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| {
            if let Ok(message) = read_string(&mut caller, ptr, len) {
                warn!(target: "downlodr::plugin", plugin_id = %caller.data().plugin_id, "{message}");
            }
        },
    )?;

    linker.func_wrap(
        "log",
        "error",
        |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| {
            if let Ok(message) = read_string(&mut caller, ptr, len) {
                error!(target: "downlodr::plugin", plugin_id = %caller.data().plugin_id, "{message}");
            }
        },
    )?;

    // timers.set_timeout(token, delay_ms) -> timer id; fires on_callback(token, 0, 0)
    linker.func_wrap(
        "timers",
        "set_timeout",
        |mut caller: Caller<'_, GuestState>, token: i32, delay_ms: i32| -> i32 {
            let state = caller.data_mut();
            if state.unloaded {
                return status::DENIED;
            }

            state.timers.retain(|_, timer| !timer.is_finished());
            state.next_timer = state.next_timer.wrapping_add(1).max(1);
            let id = state.next_timer;
            let guest = state.instance.clone();
            let delay = Duration::from_millis(delay_ms.max(0) as u64);

            let task = state.runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                deliver_later(guest, token, String::new()).await;
            });
            state.timers.insert(id, task.abort_handle());
            id
        },
    )?;

    linker.func_wrap(
        "timers",
        "clear_timeout",
        |mut caller: Caller<'_, GuestState>, id: i32| {
            if let Some(timer) = caller.data_mut().timers.remove(&id) {
                timer.abort();
            }
        },
    )?;

    // path.join(a_ptr, a_len, b_ptr, b_len, token) -> status; result via on_callback
    linker.func_wrap(
        "path",
        "join",
        |mut caller: Caller<'_, GuestState>,
         a_ptr: i32,
         a_len: i32,
         b_ptr: i32,
         b_len: i32,
         token: i32|
         -> anyhow::Result<i32> {
            let (Ok(a), Ok(b)) = (
                read_string(&mut caller, a_ptr, a_len),
                read_string(&mut caller, b_ptr, b_len),
            ) else {
                return Ok(status::MALFORMED);
            };
            let joined = Path::new(&a).join(b).to_string_lossy().into_owned();
            deliver(&mut caller, token, &joined)?;
            Ok(status::OK)
        },
    )?;

    linker.func_wrap(
        "path",
        "basename",
        |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32, token: i32| -> anyhow::Result<i32> {
            let Ok(path) = read_string(&mut caller, ptr, len) else {
                return Ok(status::MALFORMED);
            };
            let base = Path::new(&path)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            deliver(&mut caller, token, &base)?;
            Ok(status::OK)
        },
    )?;

    // downlodr.call(req_ptr, req_len, token) -> status
    linker.func_wrap(
        "downlodr",
        "call",
        |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32, token: i32| -> anyhow::Result<i32> {
            if caller.data().unloaded {
                return Ok(status::DENIED);
            }
            let Ok(raw) = read_string(&mut caller, ptr, len) else {
                return Ok(status::MALFORMED);
            };
            let Ok(request) = serde_json::from_str::<GuestRequest>(&raw) else {
                return Ok(status::MALFORMED);
            };

            let routed = {
                let state = caller.data();
                route(&state.api, &state.instance, &request.method, request.params)
            };
            let call = match routed {
                Ok(call) => call,
                Err(code) => {
                    debug!(
                        plugin_id = %caller.data().plugin_id,
                        method = %request.method,
                        code,
                        "Rejected plugin API call"
                    );
                    return Ok(code);
                }
            };

            match call {
                Call::Now(future) => {
                    let reply = reply_json(caller.data().runtime.block_on(future));
                    deliver(&mut caller, token, &reply)?;
                }
                Call::Later(future) => {
                    let state = caller.data();
                    let guest = state.instance.clone();
                    state.runtime.spawn(async move {
                        let reply = reply_json(future.await);
                        deliver_later(guest, token, reply).await;
                    });
                }
            }
            Ok(status::OK)
        },
    )?;

    Ok(())
}

#[derive(Deserialize)]
struct GuestRequest {
    method: String,
    #[serde(default)]
    params: Value,
}

/// Menu/task-bar item as a guest describes it; `onClick` is a callback token
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GuestItem {
    #[serde(default)]
    id: Option<String>,
    label: String,
    #[serde(default)]
    icon: Option<String>,
    #[serde(default)]
    tooltip: Option<String>,
    #[serde(default)]
    context: Option<ItemContext>,
    #[serde(default)]
    order: Option<i32>,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    on_click: Option<i32>,
}

impl GuestItem {
    fn into_action_item(self, guest: &Weak<Mutex<WasmInstance>>) -> crate::api::ActionItem {
        crate::api::ActionItem {
            id: self.id,
            label: self.label,
            icon: self.icon,
            tooltip: self.tooltip,
            context: self.context,
            order: self.order,
            disabled: self.disabled,
            on_click: self.on_click.map(|token| guest_handler(guest.clone(), token)),
        }
    }
}

#[derive(Deserialize)]
struct IdParams {
    id: String,
}

#[derive(Deserialize)]
struct UrlParams {
    url: String,
}

#[derive(Deserialize)]
struct AddDownloadParams {
    url: String,
    #[serde(default)]
    options: DownloadOptions,
}

#[derive(Deserialize)]
struct PathParams {
    path: String,
}

#[derive(Deserialize)]
struct SizeParams {
    bytes: u64,
}

#[derive(Deserialize)]
struct ProviderParams {
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct SettingsPageParams {
    id: String,
    title: String,
}

type Reply = BoxFuture<'static, PluginResult<Value>>;

enum Call {
    /// Completed before `call` returns; result delivered re-entrantly
    Now(Reply),
    /// Awaited in a task; result delivered once it resolves
    Later(Reply),
}

fn now<T, F>(future: F) -> Call
where
    T: Serialize,
    F: Future<Output = PluginResult<T>> + Send + 'static,
{
    Call::Now(Box::pin(async move { Ok(serde_json::to_value(future.await?)?) }))
}

fn later<T, F>(future: F) -> Call
where
    T: Serialize,
    F: Future<Output = PluginResult<T>> + Send + 'static,
{
    Call::Later(Box::pin(async move { Ok(serde_json::to_value(future.await?)?) }))
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, i32> {
    serde_json::from_value(params).map_err(|_| status::MALFORMED)
}

fn reply_json(result: PluginResult<Value>) -> String {
    match result {
        Ok(value) => json!({"ok": true, "value": value}),
        Err(e) => json!({"ok": false, "error": {"code": e.code(), "message": e.to_string()}}),
    }
    .to_string()
}

fn guest_handler(guest: Weak<Mutex<WasmInstance>>, token: i32) -> Handler {
    handler(move |context| {
        let guest = guest.clone();
        async move {
            let payload = context.unwrap_or(Value::Null).to_string();
            deliver_later(guest, token, payload).await;
        }
    })
}

/// Map a facade method name to the call that serves it
fn route(
    api: &PluginApi,
    guest: &Weak<Mutex<WasmInstance>>,
    method: &str,
    params: Value,
) -> Result<Call, i32> {
    let api = api.clone();

    let call = match method {
        "downloads.getActiveDownloads" => {
            now(async move { Ok(api.downloads.get_active_downloads().await) })
        }
        "downloads.addDownload" => {
            let p: AddDownloadParams = parse(params)?;
            now(async move { api.downloads.add_download(&p.url, p.options).await })
        }
        "downloads.getInfo" => {
            let p: UrlParams = parse(params)?;
            later(async move { api.downloads.get_info(&p.url).await })
        }
        "downloads.cancelDownload" => {
            let p: IdParams = parse(params)?;
            now(async move { api.downloads.cancel_download(&p.id).await })
        }
        "downloads.pauseDownload" => {
            let p: IdParams = parse(params)?;
            now(async move { api.downloads.pause_download(&p.id).await })
        }

        "ui.registerMenuItem" => {
            let item = parse::<GuestItem>(params)?.into_action_item(guest);
            now(async move { api.ui.register_menu_item(item).await })
        }
        "ui.unregisterMenuItem" => {
            let p: IdParams = parse(params)?;
            now(async move { api.ui.unregister_menu_item(&p.id).await })
        }
        "ui.registerTaskBarItem" => {
            let item = parse::<GuestItem>(params)?.into_action_item(guest);
            now(async move { api.ui.register_task_bar_item(item).await })
        }
        "ui.unregisterTaskBarItem" => {
            let p: IdParams = parse(params)?;
            now(async move { api.ui.unregister_task_bar_item(&p.id).await })
        }
        "ui.showNotification" => {
            let notification: NotificationOptions = parse(params)?;
            now(async move {
                api.ui.show_notification(notification);
                Ok(Value::Null)
            })
        }
        "ui.showFormatSelector" => {
            let options: FormatSelectorOptions = parse(params)?;
            later(async move { Ok(api.ui.show_format_selector(options).await.to_json()) })
        }
        "ui.showPluginModal" => {
            let options: ModalOptions = parse(params)?;
            later(async move { Ok(api.ui.show_plugin_modal(options).await.to_json()) })
        }
        "ui.showPluginSidePanel" => {
            let options: SidePanelOptions = parse(params)?;
            later(async move { Ok(api.ui.show_plugin_side_panel(options).await.to_json()) })
        }
        "ui.showSaveFileDialog" | "utilities.saveFileWithDialog" => {
            let options: SaveDialogOptions = parse(params)?;
            later(async move { Ok(api.ui.show_save_file_dialog(options).await) })
        }
        "ui.registerFormatProvider" => {
            let p: ProviderParams = parse(params)?;
            now(async move { api.ui.register_format_provider(&p.id, &p.name).await })
        }
        "ui.registerSettingsPage" => {
            let p: SettingsPageParams = parse(params)?;
            now(async move { api.ui.register_settings_page(&p.id, &p.title).await })
        }

        "formats.getSupportedFormats" => {
            now(async move { Ok(api.formats.get_supported_formats()) })
        }
        "formats.registerFormatHandler" => {
            let spec: FormatHandlerSpec = parse(params)?;
            now(async move { api.formats.register_format_handler(spec).await })
        }

        "utilities.formatFileSize" => {
            let p: SizeParams = parse(params)?;
            now(async move { Ok(api.utilities.format_file_size(p.bytes)) })
        }
        "utilities.writeFile" => {
            let request: WriteFileRequest = parse(params)?;
            now(async move { api.utilities.write_file(request).await })
        }
        "utilities.readFile" => {
            let p: PathParams = parse(params)?;
            now(async move { api.utilities.read_file(&p.path).await })
        }
        "utilities.getDataPath" => now(async move { api.utilities.data_path().await }),
        "utilities.openExternalLink" => {
            let p: UrlParams = parse(params)?;
            now(async move { api.utilities.open_external_link(&p.url).await })
        }
        "utilities.selectDirectory" => {
            let options: DirectoryPickerOptions = match params {
                Value::Null => DirectoryPickerOptions::default(),
                params => parse(params)?,
            };
            later(async move { Ok(api.utilities.select_directory(options).await) })
        }

        _ => return Err(status::UNKNOWN_METHOD),
    };

    Ok(call)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{manifest::PluginManifest, testing};
    use tempfile::TempDir;

    fn code(wat: &str) -> PluginCode {
        PluginCode {
            manifest: PluginManifest {
                id: "p1".into(),
                name: "P".into(),
                version: "1.0.0".into(),
                description: None,
                author: None,
                main: None,
                license: None,
                min_app_version: None,
                icon: None,
            },
            code: wat.as_bytes().to_vec(),
        }
    }

    fn limits() -> SandboxLimits {
        SandboxLimits {
            execution_timeout: Duration::from_millis(500),
            ..SandboxLimits::default()
        }
    }

    #[test]
    fn test_disallowed_import_module_rejected() {
        let sandbox = Sandbox::new(limits()).unwrap();
        let err = sandbox
            .compile(
                "p1",
                br#"(module (import "wasi_snapshot_preview1" "fd_write" (func (param i32 i32 i32 i32) (result i32))))"#,
            )
            .unwrap_err();
        assert!(matches!(err, PluginError::LoadFailed { .. }));
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn test_oversized_module_rejected() {
        let sandbox = Sandbox::new(SandboxLimits {
            max_module_bytes: 4,
            ..limits()
        })
        .unwrap();
        assert!(sandbox.compile("p1", b"(module)").is_err());
    }

    #[test]
    fn test_zero_fuel_rejected() {
        assert!(
            Sandbox::new(SandboxLimits {
                fuel: 0,
                ..limits()
            })
            .is_err()
        );
    }

    #[tokio::test]
    async fn test_module_without_initialize_is_non_conforming() {
        let evaluator = WasmEvaluator::new(limits());
        let exports = evaluator
            .evaluate("p1", code(r#"(module (func (export "main")))"#))
            .await
            .unwrap();
        assert!(exports.is_none());
    }

    #[tokio::test]
    async fn test_initialize_success_and_unload() {
        let root = TempDir::new().unwrap();
        let ctx = testing::guest_context(&root).await;
        let evaluator = WasmEvaluator::new(limits());

        let exports = evaluator
            .evaluate(
                "p1",
                code(
                    r#"(module
                        (global $unloaded (mut i32) (i32.const 0))
                        (func (export "initialize") (result i32) (i32.const 0))
                        (func (export "on_unload") (global.set $unloaded (i32.const 1))))"#,
                ),
            )
            .await
            .unwrap()
            .unwrap();

        exports.initialize(PluginApi::new("p1", &ctx)).await.unwrap();
        exports.on_unload().await.unwrap();
        // Second unload is a no-op
        exports.on_unload().await.unwrap();
    }

    #[tokio::test]
    async fn test_nonzero_initialize_fails() {
        let root = TempDir::new().unwrap();
        let ctx = testing::guest_context(&root).await;
        let exports = WasmEvaluator::new(limits())
            .evaluate(
                "p1",
                code(r#"(module (func (export "initialize") (result i32) (i32.const 7)))"#),
            )
            .await
            .unwrap()
            .unwrap();

        let err = exports.initialize(PluginApi::new("p1", &ctx)).await.unwrap_err();
        assert!(matches!(err, PluginError::InitializationFailed { .. }));
        assert!(err.to_string().contains("returned 7"));
    }

    #[tokio::test]
    async fn test_unknown_function_in_allowed_module_traps_when_called() {
        let root = TempDir::new().unwrap();
        let ctx = testing::guest_context(&root).await;
        let exports = WasmEvaluator::new(limits())
            .evaluate(
                "p1",
                code(
                    r#"(module
                        (import "downlodr" "spawn_process" (func $spawn))
                        (func (export "initialize") (result i32) (call $spawn) (i32.const 0)))"#,
                ),
            )
            .await
            .unwrap()
            .unwrap();

        let err = exports.initialize(PluginApi::new("p1", &ctx)).await.unwrap_err();
        assert!(matches!(err, PluginError::InitializationFailed { .. }));
    }

    #[tokio::test]
    async fn test_runaway_loop_is_interrupted() {
        let root = TempDir::new().unwrap();
        let ctx = testing::guest_context(&root).await;
        let exports = WasmEvaluator::new(SandboxLimits {
            fuel: u64::MAX / 2,
            execution_timeout: Duration::from_millis(100),
            ..SandboxLimits::default()
        })
        .evaluate(
            "p1",
            code(r#"(module (func (export "initialize") (result i32) (loop $spin (br $spin)) (i32.const 0)))"#),
        )
        .await
        .unwrap()
        .unwrap();

        let err = exports.initialize(PluginApi::new("p1", &ctx)).await.unwrap_err();
        assert!(matches!(err, PluginError::InitializationFailed { .. }));
    }

    #[tokio::test]
    async fn test_fuel_exhaustion_is_interrupted() {
        let root = TempDir::new().unwrap();
        let ctx = testing::guest_context(&root).await;
        let exports = WasmEvaluator::new(SandboxLimits {
            fuel: 10_000,
            ..limits()
        })
        .evaluate(
            "p1",
            code(r#"(module (func (export "initialize") (result i32) (loop $spin (br $spin)) (i32.const 0)))"#),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(exports.initialize(PluginApi::new("p1", &ctx)).await.is_err());
    }

    #[test]
    fn test_reply_json_shapes() {
        let ok: Value = serde_json::from_str(&reply_json(Ok(json!("id-1")))).unwrap();
        assert_eq!(ok, json!({"ok": true, "value": "id-1"}));

        let err: Value =
            serde_json::from_str(&reply_json(Err(PluginError::PathViolation("x".into())))).unwrap();
        assert_eq!(err["ok"], json!(false));
        assert_eq!(err["error"]["code"], json!("E504"));
    }
}
