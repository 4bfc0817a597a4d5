//! The plugin registry: lifecycle state machine and host-facing controls.
//!
//! Every mutation takes the registry's write lock for its whole duration, so
//! readers only ever see entries in a settled state (`Active` or `Error`).
//! Plugin code runs inside `catch_unwind`; a panicking plugin is moved to
//! `Error` and the host carries on.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use hostguard_core::{
    CURRENT_API_VERSION, ConfigError, DEFAULT_MAX_PLUGINS, ManagerSection, ModuleHandle,
    PluginConfig, PluginError, PluginFault, PluginInfo, PluginResult, PluginState, RegistryFile,
    panic_message,
};
use hostguard_security::{SecurityContext, SecurityError, SecurityGate, SignatureVerification};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::diagnostics::RegistryDiagnostics;
use crate::graph::DependencyGraph;
use crate::loader::{CREATE_SYMBOL, EntryPoints, INFO_SYMBOL, ModuleLoader, module_name};
use crate::plugin::{Capabilities, Capability, Plugin, PluginContext, PresentationHost};

/// Default directory plugins are discovered in.
pub fn default_plugin_directory() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hostguard")
        .join("plugins")
}

/// Read-only view of a registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct PluginStatus {
    pub name: String,
    pub path: PathBuf,
    pub state: PluginState,
    pub config: PluginConfig,
    pub info: Option<PluginInfo>,
    pub dependencies: Vec<String>,
    pub capabilities: Capabilities,
    pub faults: Vec<PluginFault>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub load_duration: Option<Duration>,
    /// Subject of the module's signature, when it was signed.
    pub signed_by: Option<String>,
}

struct PluginEntry {
    name: String,
    path: PathBuf,
    state: PluginState,
    config: PluginConfig,
    info: Option<PluginInfo>,
    capabilities: Capabilities,
    faults: Vec<PluginFault>,
    loaded_at: Option<DateTime<Utc>>,
    load_duration: Option<Duration>,
    signature: Option<SignatureVerification>,
    module: Option<ModuleHandle>,
    entry_points: EntryPoints,
    instance: Option<Mutex<Box<dyn Plugin>>>,
}

/// A panic caught in a hook, tied to the module instance that raised it.
struct HookFault {
    name: String,
    module: Option<ModuleHandle>,
    message: String,
}

impl HookFault {
    fn new(entry: &PluginEntry, message: String) -> Self {
        Self {
            name: entry.name.clone(),
            module: entry.module,
            message,
        }
    }
}

impl PluginEntry {
    fn new(name: String, path: PathBuf, config: PluginConfig) -> Self {
        Self {
            name,
            path,
            state: PluginState::Unloaded,
            config,
            info: None,
            capabilities: Capabilities::new(),
            faults: Vec::new(),
            loaded_at: None,
            load_duration: None,
            signature: None,
            module: None,
            entry_points: EntryPoints::default(),
            instance: None,
        }
    }

    fn transition(&mut self, to: PluginState) -> PluginResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(PluginError::InvalidTransition {
                name: self.name.clone(),
                from: self.state,
                to,
            });
        }
        tracing::debug!(
            target: "plugin_registry",
            plugin = %self.name,
            from = %self.state,
            to = %to,
            "State transition"
        );
        self.state = to;
        Ok(())
    }

    fn instance_mut(&mut self) -> PluginResult<&mut Box<dyn Plugin>> {
        let name = self.name.clone();
        self.instance
            .as_mut()
            .map(|instance| instance.get_mut())
            .ok_or(PluginError::InvalidPlugin {
                name,
                message: "no plugin instance".to_string(),
            })
    }

    fn status(&self) -> PluginStatus {
        PluginStatus {
            name: self.name.clone(),
            path: self.path.clone(),
            state: self.state,
            config: self.config.clone(),
            info: self.info.clone(),
            dependencies: self
                .info
                .as_ref()
                .map(|info| info.dependencies.clone())
                .unwrap_or_default(),
            capabilities: self.capabilities.clone(),
            faults: self.faults.clone(),
            loaded_at: self.loaded_at,
            load_duration: self.load_duration,
            signed_by: self
                .signature
                .as_ref()
                .and_then(|verification| verification.info.as_ref())
                .map(|info| info.subject.clone()),
        }
    }
}

#[derive(Debug)]
struct Settings {
    initialized: bool,
    plugin_directory: PathBuf,
    max_plugins: usize,
    /// Sections from the last loaded configuration file.
    configured: IndexMap<String, PluginConfig>,
}

/// Run plugin code, turning a panic into its message.
fn guarded<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(payload.as_ref()))
}

fn security_violation(name: &str, err: SecurityError) -> PluginError {
    PluginError::SecurityViolation {
        name: name.to_string(),
        message: err.to_string(),
    }
}

fn check_api(name: &str, info: &PluginInfo) -> PluginResult<()> {
    if CURRENT_API_VERSION.is_compatible(&info.api_version) {
        Ok(())
    } else {
        Err(PluginError::IncompatibleApi {
            name: name.to_string(),
            required: CURRENT_API_VERSION.to_string(),
            found: info.api_version.to_string(),
        })
    }
}

/// Owns every loaded plugin and drives it through its lifecycle.
///
/// # Example
///
/// ```ignore
/// let gate = Arc::new(SecurityGate::new(SecurityConfiguration::default())?);
/// gate.initialize()?;
///
/// let registry = PluginRegistry::new(Arc::new(NativeModuleLoader::new()), gate);
/// registry.initialize(default_plugin_directory())?;
/// registry.load(Path::new("plugins/viewer.so"), PluginConfig::default())?;
///
/// registry.update(1.0 / 60.0);
/// registry.shutdown();
/// ```
pub struct PluginRegistry {
    loader: Arc<dyn ModuleLoader>,
    gate: Arc<SecurityGate>,
    requester: SecurityContext,
    plugins: RwLock<IndexMap<String, PluginEntry>>,
    graph: RwLock<DependencyGraph>,
    settings: RwLock<Settings>,
    last_error: Mutex<Option<String>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("requester", &self.requester.requester)
            .field("plugins", &self.plugins.read().keys().collect::<Vec<_>>())
            .field("settings", &*self.settings.read())
            .field("open_modules", &self.loader.open_count())
            .finish_non_exhaustive()
    }
}

impl PluginRegistry {
    /// Create a registry that opens modules with `loader` and vets them with
    /// `gate`. Call [`initialize`](Self::initialize) before loading.
    pub fn new(loader: Arc<dyn ModuleLoader>, gate: Arc<SecurityGate>) -> Self {
        Self {
            loader,
            gate,
            requester: SecurityContext::new("host"),
            plugins: RwLock::new(IndexMap::new()),
            graph: RwLock::new(DependencyGraph::new()),
            settings: RwLock::new(Settings {
                initialized: false,
                plugin_directory: default_plugin_directory(),
                max_plugins: DEFAULT_MAX_PLUGINS,
                configured: IndexMap::new(),
            }),
            last_error: Mutex::new(None),
        }
    }

    /// Set the capacity. Values below one are treated as one.
    pub fn with_max_plugins(self, max_plugins: usize) -> Self {
        self.settings.write().max_plugins = max_plugins.max(1);
        self
    }

    /// Identity presented to the gate when authorizing loads.
    pub fn with_requester(mut self, requester: SecurityContext) -> Self {
        self.requester = requester;
        self
    }

    pub fn security(&self) -> &Arc<SecurityGate> {
        &self.gate
    }

    // ---- lifecycle ----

    /// Prepare the registry, creating the plugin directory if needed.
    pub fn initialize(&self, plugin_directory: impl Into<PathBuf>) -> PluginResult<()> {
        let plugin_directory = plugin_directory.into();
        self.check(std::fs::create_dir_all(&plugin_directory).map_err(PluginError::from))?;

        let mut settings = self.settings.write();
        settings.plugin_directory = plugin_directory;
        settings.initialized = true;
        tracing::info!(
            target: "plugin_registry",
            directory = %settings.plugin_directory.display(),
            max_plugins = settings.max_plugins,
            "Plugin registry initialized"
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.settings.read().initialized
    }

    /// Unload every plugin, dependents before their dependencies.
    pub fn shutdown(&self) {
        let names = self.loaded_plugin_names();
        let mut order = self.graph.read().resolve_order(&names).unwrap_or_else(|err| {
            tracing::warn!(target: "plugin_registry", error = %err, "Falling back to load order for shutdown");
            names.clone()
        });
        order.reverse();

        for name in order {
            if let Err(err) = self.unload(&name) {
                tracing::warn!(target: "plugin_registry", plugin = %name, error = %err, "Unload during shutdown failed");
            }
        }

        let leftovers: Vec<PluginEntry> = {
            let mut plugins = self.plugins.write();
            plugins.drain(..).map(|(_, entry)| entry).collect()
        };
        for mut entry in leftovers {
            let active = entry.state.is_active();
            self.retire(&mut entry, active);
        }
        *self.graph.write() = DependencyGraph::new();
        self.settings.write().initialized = false;
        tracing::info!(target: "plugin_registry", "Plugin registry shut down");
    }

    /// Load the module at `path` and bring it to `Active`.
    ///
    /// The entry is keyed by the file stem. Loading a name that is already
    /// active succeeds without doing anything; loading over an errored entry
    /// replaces it. A failed load leaves an `Error` entry behind carrying the
    /// cause.
    pub fn load(&self, path: &Path, config: PluginConfig) -> PluginResult<()> {
        let Some(name) = module_name(path) else {
            return self.fail(PluginError::InvalidPlugin {
                name: path.display().to_string(),
                message: "path has no file name".to_string(),
            });
        };

        let mut plugins = self.plugins.write();
        let (initialized, max_plugins) = {
            let settings = self.settings.read();
            (settings.initialized, settings.max_plugins)
        };
        if !initialized {
            return self.fail(PluginError::NotInitialized);
        }

        let replacing = match plugins.get(&name) {
            Some(entry) if entry.state.is_active() => {
                tracing::debug!(target: "plugin_registry", plugin = %name, "Plugin already active");
                return Ok(());
            }
            Some(_) => true,
            None => false,
        };
        if !replacing && plugins.len() >= max_plugins {
            return self.fail(PluginError::CapacityReached { limit: max_plugins });
        }
        if !path.exists() {
            return self.fail(PluginError::NotFound {
                path: path.to_path_buf(),
            });
        }
        if replacing && let Some(mut stale) = plugins.shift_remove(&name) {
            tracing::debug!(target: "plugin_registry", plugin = %name, "Replacing errored entry");
            self.graph.write().remove_node(&name);
            self.release(&mut stale);
        }

        let started = Instant::now();
        let mut entry = PluginEntry::new(name.clone(), path.to_path_buf(), config);
        let result = entry
            .transition(PluginState::Loading)
            .and_then(|()| self.run_load(&mut entry, &plugins));

        match &result {
            Ok(()) => {
                let elapsed = started.elapsed();
                entry.loaded_at = Some(Utc::now());
                entry.load_duration = Some(elapsed);
                tracing::info!(
                    target: "plugin_registry",
                    plugin = %name,
                    version = entry.info.as_ref().map(|info| info.version.as_str()).unwrap_or_default(),
                    duration_ms = elapsed.as_millis() as u64,
                    "Plugin loaded"
                );
            }
            Err(err) => {
                entry.faults.push(PluginFault::from(err));
                if let Err(transition) = entry.transition(PluginState::Error) {
                    tracing::warn!(target: "plugin_registry", plugin = %name, error = %transition, "Could not mark entry as errored");
                }
                tracing::error!(target: "plugin_registry", plugin = %name, error = %err, "Plugin load failed");
                self.record_error(err);
            }
        }

        plugins.insert(name, entry);
        result
    }

    fn run_load(
        &self,
        entry: &mut PluginEntry,
        plugins: &IndexMap<String, PluginEntry>,
    ) -> PluginResult<()> {
        self.gate
            .check_module_path(&entry.path)
            .map_err(|e| security_violation(&entry.name, e))?;

        entry.module = Some(self.loader.open(&entry.path)?);
        let result = self.bring_up(entry, plugins);
        if result.is_err() {
            self.graph.write().remove_node(&entry.name);
            self.release(entry);
        }
        result
    }

    fn bring_up(
        &self,
        entry: &mut PluginEntry,
        plugins: &IndexMap<String, PluginEntry>,
    ) -> PluginResult<()> {
        let name = entry.name.clone();
        let module = entry.module.ok_or(PluginError::StaleHandle)?;
        let entry_points = self.loader.entry_points(module)?;
        let Some(create) = entry_points.create else {
            return Err(PluginError::InvalidPlugin {
                name,
                message: format!("module does not export {CREATE_SYMBOL}"),
            });
        };
        entry.entry_points = entry_points;

        if let Some(declared) = entry_points.info {
            let info = guarded(declared).map_err(|message| PluginError::InvalidPlugin {
                name: name.clone(),
                message: format!("{INFO_SYMBOL} panicked: {message}"),
            })?;
            check_api(&name, &info)?;
        }

        entry.signature = self
            .gate
            .verify_module(&entry.path)
            .map_err(|e| security_violation(&name, e))?;
        entry.transition(PluginState::Loaded)?;

        let instance = guarded(create).map_err(|message| PluginError::InvalidPlugin {
            name: name.clone(),
            message: format!("{CREATE_SYMBOL} panicked: {message}"),
        })?;
        entry.instance = Some(Mutex::new(instance));

        let plugin = entry.instance_mut()?;
        let (info, capabilities) = guarded(|| (plugin.info(), plugin.capabilities())).map_err(
            |message| PluginError::InvalidPlugin {
                name: name.clone(),
                message: format!("info panicked: {message}"),
            },
        )?;
        check_api(&name, &info)?;
        self.gate
            .authorize_plugin_load(&info, &self.requester)
            .map_err(|e| security_violation(&name, e))?;

        self.graph.write().add_node(&name, &info.dependencies);
        let self_dependent = info.dependencies.contains(&name);
        let missing: Vec<String> = info
            .dependencies
            .iter()
            .filter(|dependency| {
                !plugins
                    .get(dependency.as_str())
                    .is_some_and(|other| other.state.is_active())
            })
            .cloned()
            .collect();
        entry.info = Some(info);
        entry.capabilities = capabilities;
        if self_dependent {
            return Err(PluginError::CircularDependency { cycle: vec![name] });
        }
        if !missing.is_empty() {
            return Err(PluginError::DependencyMissing { name, missing });
        }

        entry.transition(PluginState::Initializing)?;
        let context = PluginContext::new(&name, entry.config.clone(), Arc::clone(&self.gate));
        let plugin = entry.instance_mut()?;
        match guarded(|| plugin.initialize(&context)) {
            Ok(true) => {}
            Ok(false) => {
                return Err(PluginError::InitializationFailed {
                    name,
                    message: "initialize returned false".to_string(),
                });
            }
            Err(message) => {
                return Err(PluginError::InitializationFailed {
                    name,
                    message: format!("initialize panicked: {message}"),
                });
            }
        }
        entry.transition(PluginState::Active)
    }

    /// Shut down and remove a plugin.
    ///
    /// Refused while other active plugins depend on it.
    pub fn unload(&self, name: &str) -> PluginResult<()> {
        let mut plugins = self.plugins.write();
        let Some(entry) = plugins.get(name) else {
            return self.fail(PluginError::UnknownPlugin {
                name: name.to_string(),
            });
        };

        if entry.state.is_active() {
            let dependents: Vec<String> = self
                .graph
                .read()
                .dependents(name)
                .into_iter()
                .filter(|dependent| {
                    plugins
                        .get(dependent.as_str())
                        .is_some_and(|other| other.state.is_active())
                })
                .collect();
            if !dependents.is_empty() {
                return self.fail(PluginError::DependentsActive {
                    name: name.to_string(),
                    dependents,
                });
            }
        }

        let Some(mut entry) = plugins.shift_remove(name) else {
            return self.fail(PluginError::UnknownPlugin {
                name: name.to_string(),
            });
        };
        let was_active = entry.state.is_active();
        if let Err(err) = entry.transition(PluginState::Unloading) {
            plugins.insert(name.to_string(), entry);
            return self.fail(err);
        }

        self.retire(&mut entry, was_active);
        entry.transition(PluginState::Unloaded)?;
        self.graph.write().remove_node(name);
        tracing::info!(target: "plugin_registry", plugin = %name, "Plugin unloaded");
        Ok(())
    }

    /// Unload then load again from the recorded path and configuration.
    ///
    /// Not atomic: if the second load fails the plugin stays out.
    pub fn reload(&self, name: &str) -> PluginResult<()> {
        let (path, config) = {
            let plugins = self.plugins.read();
            match plugins.get(name) {
                Some(entry) => (entry.path.clone(), entry.config.clone()),
                None => {
                    return self.fail(PluginError::UnknownPlugin {
                        name: name.to_string(),
                    });
                }
            }
        };
        self.unload(name)?;
        self.load(&path, config)
    }

    // Shutdown hook for plugins that were running, then release.
    fn retire(&self, entry: &mut PluginEntry, call_shutdown: bool) {
        let name = entry.name.clone();
        if call_shutdown
            && let Ok(plugin) = entry.instance_mut()
            && let Err(message) = guarded(|| plugin.shutdown())
        {
            let err = PluginError::Runtime {
                name: name.clone(),
                message: format!("shutdown panicked: {message}"),
            };
            tracing::error!(target: "plugin_registry", plugin = %name, error = %err, "Plugin fault");
            self.record_error(&err);
        }
        self.release(entry);
    }

    // Destroy the instance, then close the module it came from.
    fn release(&self, entry: &mut PluginEntry) {
        if let Some(instance) = entry.instance.take() {
            let plugin = instance.into_inner();
            let destroy = entry.entry_points.destroy;
            let outcome = guarded(move || match destroy {
                Some(destroy) => destroy(plugin),
                None => drop(plugin),
            });
            if let Err(message) = outcome {
                tracing::warn!(target: "plugin_registry", plugin = %entry.name, %message, "Plugin destructor panicked");
            }
        }
        if let Some(module) = entry.module.take()
            && let Err(err) = self.loader.close(module)
        {
            tracing::warn!(target: "plugin_registry", plugin = %entry.name, error = %err, "Module close failed");
        }
    }

    // ---- per-frame hooks ----

    /// Tick every enabled active plugin that declares `Update`.
    ///
    /// A plugin that panics is moved to `Error`; the others still run.
    pub fn update(&self, delta_seconds: f32) {
        self.dispatch("update", Some(Capability::Update), |_, _, plugin| {
            plugin.update(delta_seconds)
        });
    }

    /// Let every enabled active plugin that declares `Render` render.
    pub fn render(&self) {
        self.dispatch("render", Some(Capability::Render), |_, _, plugin| plugin.render());
    }

    /// Hand the windows and menu items of active plugins to the front end.
    ///
    /// Only surfaces a plugin declares in its capabilities are queried.
    /// Returns the number of registrations made.
    pub fn integrate(&self, host: &mut dyn PresentationHost) -> usize {
        let mut registered = 0;
        self.dispatch("integrate", None, |name, capabilities, plugin| {
            if capabilities.contains(&Capability::Window)
                && let Some(provider) = plugin.window_provider()
            {
                for window in provider.windows() {
                    host.register_window(name, window);
                    registered += 1;
                }
            }
            if capabilities.contains(&Capability::Menu)
                && let Some(provider) = plugin.menu_provider()
            {
                for item in provider.menu_items() {
                    host.register_menu_item(name, item);
                    registered += 1;
                }
            }
        });
        registered
    }

    /// Ask a plugin to draw one of its windows.
    pub fn draw_window(&self, plugin: &str, window: &str) -> PluginResult<()> {
        self.invoke(plugin, "draw_window", Capability::Window, |instance| {
            if let Some(provider) = instance.window_provider() {
                provider.draw_window(window);
            }
        })
    }

    /// Forward a menu activation to the plugin that owns the item.
    pub fn menu_action(&self, plugin: &str, item: &str) -> PluginResult<()> {
        self.invoke(plugin, "menu_action", Capability::Menu, |instance| {
            if let Some(provider) = instance.menu_provider() {
                provider.on_menu_action(item);
            }
        })
    }

    fn dispatch(
        &self,
        hook: &str,
        required: Option<Capability>,
        mut call: impl FnMut(&str, &Capabilities, &mut dyn Plugin),
    ) {
        let faulted: Vec<HookFault> = {
            let plugins = self.plugins.read();
            plugins
                .values()
                .filter(|entry| entry.state.is_active() && entry.config.enabled)
                .filter(|entry| required.is_none_or(|c| entry.capabilities.contains(&c)))
                .filter_map(|entry| {
                    let mut plugin = entry.instance.as_ref()?.lock();
                    guarded(|| call(&entry.name, &entry.capabilities, &mut **plugin))
                        .err()
                        .map(|message| HookFault::new(entry, message))
                })
                .collect()
        };
        self.demote(hook, faulted);
    }

    fn invoke(
        &self,
        name: &str,
        hook: &str,
        capability: Capability,
        call: impl FnOnce(&mut dyn Plugin),
    ) -> PluginResult<()> {
        let fault = {
            let plugins = self.plugins.read();
            let Some(entry) = plugins.get(name).filter(|entry| entry.state.is_active()) else {
                return self.fail(PluginError::UnknownPlugin {
                    name: name.to_string(),
                });
            };
            if !entry.capabilities.contains(&capability) {
                return self.fail(PluginError::InvalidPlugin {
                    name: name.to_string(),
                    message: format!("plugin does not provide {capability}"),
                });
            }
            let Some(instance) = entry.instance.as_ref() else {
                return self.fail(PluginError::UnknownPlugin {
                    name: name.to_string(),
                });
            };
            let mut plugin = instance.lock();
            guarded(|| call(&mut **plugin))
                .err()
                .map(|message| HookFault::new(entry, message))
        };

        match fault {
            None => Ok(()),
            Some(fault) => {
                let err = PluginError::Runtime {
                    name: name.to_string(),
                    message: format!("{hook} panicked: {}", fault.message),
                };
                self.demote(hook, vec![fault]);
                Err(err)
            }
        }
    }

    /// Record hook failures. A fault raised by an instance that has since
    /// been unloaded or reloaded is dropped.
    fn demote(&self, hook: &str, faulted: Vec<HookFault>) {
        if faulted.is_empty() {
            return;
        }
        let mut plugins = self.plugins.write();
        for fault in faulted {
            let Some(entry) = plugins.get_mut(&fault.name) else {
                continue;
            };
            if entry.module != fault.module {
                tracing::debug!(
                    target: "plugin_registry",
                    plugin = %fault.name,
                    hook,
                    "Fault from a replaced instance ignored"
                );
                continue;
            }
            let err = PluginError::Runtime {
                name: fault.name.clone(),
                message: format!("{hook} panicked: {}", fault.message),
            };
            tracing::error!(
                target: "plugin_registry",
                plugin = %fault.name,
                error = %err,
                "Plugin fault"
            );
            entry.faults.push(PluginFault::from(&err));
            if entry.state.is_active() && entry.transition(PluginState::Error).is_err() {
                continue;
            }
            self.record_error(&err);
        }
    }

    // ---- queries ----

    /// State of `name`; `Unloaded` when there is no such entry.
    pub fn plugin_state(&self, name: &str) -> PluginState {
        self.plugins
            .read()
            .get(name)
            .map(|entry| entry.state)
            .unwrap_or_default()
    }

    pub fn plugin(&self, name: &str) -> Option<PluginStatus> {
        self.plugins.read().get(name).map(PluginEntry::status)
    }

    /// Every entry in load order.
    pub fn plugins(&self) -> Vec<PluginStatus> {
        self.plugins.read().values().map(PluginEntry::status).collect()
    }

    pub fn active_plugins(&self) -> Vec<String> {
        self.plugins
            .read()
            .values()
            .filter(|entry| entry.state.is_active())
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// Names of every entry, errored ones included.
    pub fn loaded_plugin_names(&self) -> Vec<String> {
        self.plugins.read().keys().cloned().collect()
    }

    /// Whether `name` has an entry that is not in `Error`.
    pub fn is_plugin_loaded(&self, name: &str) -> bool {
        self.plugins
            .read()
            .get(name)
            .is_some_and(|entry| entry.state != PluginState::Error)
    }

    pub fn is_plugin_active(&self, name: &str) -> bool {
        self.plugin_state(name).is_active()
    }

    /// Number of entries, counting errored ones.
    pub fn plugin_count(&self) -> usize {
        self.plugins.read().len()
    }

    pub fn active_count(&self) -> usize {
        self.plugins
            .read()
            .values()
            .filter(|entry| entry.state.is_active())
            .count()
    }

    pub fn plugin_errors(&self, name: &str) -> Vec<PluginFault> {
        self.plugins
            .read()
            .get(name)
            .map(|entry| entry.faults.clone())
            .unwrap_or_default()
    }

    pub fn plugin_config(&self, name: &str) -> Option<PluginConfig> {
        self.plugins.read().get(name).map(|entry| entry.config.clone())
    }

    pub fn dependencies(&self, name: &str) -> Vec<String> {
        self.graph.read().dependencies(name)
    }

    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.graph.read().dependents(name)
    }

    pub fn diagnostics(&self) -> RegistryDiagnostics {
        let statuses = self.plugins();
        RegistryDiagnostics::new(&statuses, self.max_plugin_count())
    }

    // ---- control ----

    /// Disabled plugins stay loaded but skip `update`, `render` and
    /// `integrate`.
    pub fn set_plugin_enabled(&self, name: &str, enabled: bool) -> PluginResult<()> {
        let mut plugins = self.plugins.write();
        let Some(entry) = plugins.get_mut(name) else {
            return self.fail(PluginError::UnknownPlugin {
                name: name.to_string(),
            });
        };
        entry.config.enabled = enabled;
        tracing::info!(target: "plugin_registry", plugin = %name, enabled, "Plugin toggled");
        Ok(())
    }

    pub fn max_plugin_count(&self) -> usize {
        self.settings.read().max_plugins
    }

    /// Change the capacity. Existing entries are kept even above the new
    /// limit; only further loads are refused.
    pub fn set_max_plugin_count(&self, max_plugins: usize) -> PluginResult<()> {
        if max_plugins == 0 {
            return self.fail(PluginError::Config(ConfigError::Invalid(
                "MaxPluginCount must be at least 1".to_string(),
            )));
        }
        self.settings.write().max_plugins = max_plugins;
        Ok(())
    }

    pub fn is_at_max_capacity(&self) -> bool {
        self.plugin_count() >= self.max_plugin_count()
    }

    pub fn plugin_directory(&self) -> PathBuf {
        self.settings.read().plugin_directory.clone()
    }

    /// Every loaded plugin ordered after its dependencies.
    pub fn resolve_dependencies(&self) -> PluginResult<Vec<String>> {
        let names = self.loaded_plugin_names();
        let order = self.graph.read().resolve_order(&names);
        self.check(order)
    }

    /// Module files in `directory`, sorted by path.
    pub fn scan_for_plugins(&self, directory: &Path) -> PluginResult<Vec<PathBuf>> {
        let entries = self.check(std::fs::read_dir(directory).map_err(PluginError::from))?;
        let mut modules: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| {
                path.extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(std::env::consts::DLL_EXTENSION))
            })
            .collect();
        modules.sort();
        tracing::debug!(target: "plugin_registry", directory = %directory.display(), found = modules.len(), "Scanned for plugins");
        Ok(modules)
    }

    /// Run the security pipeline on `path` and read its metadata without
    /// registering it.
    pub fn validate_plugin(&self, path: &Path) -> PluginResult<PluginInfo> {
        let name = module_name(path).unwrap_or_else(|| path.display().to_string());
        self.check(
            self.gate
                .validate_plugin(path)
                .map(|_| ())
                .map_err(|e| security_violation(&name, e)),
        )?;
        self.peek_plugin_info(path)
    }

    /// Open the module just long enough to read its metadata.
    pub fn peek_plugin_info(&self, path: &Path) -> PluginResult<PluginInfo> {
        let Some(name) = module_name(path) else {
            return self.fail(PluginError::InvalidPlugin {
                name: path.display().to_string(),
                message: "path has no file name".to_string(),
            });
        };
        if !path.exists() {
            return self.fail(PluginError::NotFound {
                path: path.to_path_buf(),
            });
        }
        self.check(
            self.gate
                .check_module_path(path)
                .map_err(|e| security_violation(&name, e)),
        )?;

        let module = self.check(self.loader.open(path))?;
        let result = self.read_info(&name, module);
        if let Err(err) = self.loader.close(module) {
            tracing::warn!(target: "plugin_registry", plugin = %name, error = %err, "Module close failed");
        }
        self.check(result)
    }

    fn read_info(&self, name: &str, module: ModuleHandle) -> PluginResult<PluginInfo> {
        let entry_points = self.loader.entry_points(module)?;
        let Some(create) = entry_points.create else {
            return Err(PluginError::InvalidPlugin {
                name: name.to_string(),
                message: format!("module does not export {CREATE_SYMBOL}"),
            });
        };

        let info = match entry_points.info {
            Some(declared) => guarded(declared),
            None => guarded(|| {
                let plugin = create();
                let info = plugin.info();
                match entry_points.destroy {
                    Some(destroy) => destroy(plugin),
                    None => drop(plugin),
                }
                info
            }),
        }
        .map_err(|message| PluginError::InvalidPlugin {
            name: name.to_string(),
            message: format!("reading metadata panicked: {message}"),
        })?;

        check_api(name, &info)?;
        Ok(info)
    }

    // ---- configuration ----

    /// Write the manager settings and every known plugin section.
    pub fn save_configuration(&self, path: &Path) -> PluginResult<()> {
        let file = {
            let plugins = self.plugins.read();
            let settings = self.settings.read();
            let mut sections = settings.configured.clone();
            for entry in plugins.values() {
                sections.insert(entry.name.clone(), entry.config.clone());
            }
            RegistryFile {
                manager: ManagerSection {
                    max_plugin_count: settings.max_plugins,
                    plugin_directory: settings.plugin_directory.clone(),
                },
                plugins: sections,
            }
        };
        self.check(file.save(path).map_err(PluginError::from))?;
        tracing::info!(target: "plugin_registry", path = %path.display(), "Registry configuration saved");
        Ok(())
    }

    /// Apply a configuration file. A relative plugin directory is taken
    /// relative to the file.
    pub fn load_configuration(&self, path: &Path) -> PluginResult<()> {
        let file = self.check(RegistryFile::load(path).map_err(PluginError::from))?;
        let plugin_directory = match path.parent() {
            Some(parent) if file.manager.plugin_directory.is_relative() => {
                parent.join(&file.manager.plugin_directory)
            }
            _ => file.manager.plugin_directory.clone(),
        };

        let mut plugins = self.plugins.write();
        {
            let mut settings = self.settings.write();
            settings.max_plugins = file.manager.max_plugin_count;
            settings.plugin_directory = plugin_directory;
            settings.configured = file.plugins.clone();
        }
        for (name, config) in &file.plugins {
            if let Some(entry) = plugins.get_mut(name) {
                entry.config = config.clone();
            }
        }
        tracing::info!(
            target: "plugin_registry",
            path = %path.display(),
            sections = file.plugins.len(),
            "Registry configuration loaded"
        );
        Ok(())
    }

    /// Load every configured plugin marked `AutoLoad`, dependencies first.
    ///
    /// Modules are looked up as `<plugin directory>/<name>.<platform
    /// extension>`. Higher priority loads earlier among independent plugins.
    /// Individual failures are recorded and skipped. Returns the names that
    /// became active.
    pub fn auto_load(&self) -> PluginResult<Vec<String>> {
        let (initialized, directory, configured) = {
            let settings = self.settings.read();
            (
                settings.initialized,
                settings.plugin_directory.clone(),
                settings.configured.clone(),
            )
        };
        if !initialized {
            return self.fail(PluginError::NotInitialized);
        }

        let mut candidates: Vec<(String, PluginConfig)> = configured
            .into_iter()
            .filter(|(_, config)| config.auto_load && config.enabled)
            .collect();
        candidates.sort_by(|a, b| b.1.priority.cmp(&a.1.priority));

        let mut graph = DependencyGraph::new();
        let mut pending: IndexMap<String, (PathBuf, PluginConfig)> = IndexMap::new();
        for (name, config) in candidates {
            let path = directory.join(format!("{name}.{}", std::env::consts::DLL_EXTENSION));
            match self.peek_plugin_info(&path) {
                Ok(info) => {
                    graph.add_node(&name, &info.dependencies);
                    pending.insert(name, (path, config));
                }
                Err(err) => {
                    tracing::warn!(target: "plugin_registry", plugin = %name, error = %err, "Skipping auto-load plugin");
                }
            }
        }

        let names: Vec<String> = pending.keys().cloned().collect();
        let order = self.check(graph.resolve_order(&names))?;

        let mut loaded = Vec::new();
        for name in order {
            let Some((path, config)) = pending.shift_remove(&name) else {
                continue;
            };
            match self.load(&path, config) {
                Ok(()) => loaded.push(name),
                Err(err) => {
                    tracing::warn!(target: "plugin_registry", plugin = %name, error = %err, "Auto-load failed");
                }
            }
        }
        Ok(loaded)
    }

    /// Restore default capacity and plugin configuration. Loaded plugins
    /// stay loaded.
    pub fn reset_to_defaults(&self) {
        let mut plugins = self.plugins.write();
        {
            let mut settings = self.settings.write();
            settings.max_plugins = DEFAULT_MAX_PLUGINS;
            settings.configured.clear();
        }
        for entry in plugins.values_mut() {
            entry.config = PluginConfig::default();
        }
        drop(plugins);
        self.clear_errors();
    }

    // ---- errors ----

    /// Message of the most recent failure.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn has_errors(&self) -> bool {
        self.last_error.lock().is_some()
    }

    pub fn clear_errors(&self) {
        *self.last_error.lock() = None;
    }

    fn record_error(&self, err: &PluginError) {
        *self.last_error.lock() = Some(err.to_string());
    }

    fn fail<T>(&self, err: PluginError) -> PluginResult<T> {
        tracing::warn!(target: "plugin_registry", error = %err, "Registry operation failed");
        self.record_error(&err);
        Err(err)
    }

    fn check<T>(&self, result: PluginResult<T>) -> PluginResult<T> {
        result.or_else(|err| self.fail(err))
    }
}

impl Drop for PluginRegistry {
    fn drop(&mut self) {
        if !self.plugins.get_mut().is_empty() {
            self.shutdown();
        }
    }
}
