//! Plugin lifecycle management for hostguard.
//!
//! This crate loads native modules into a host process, orders them by their
//! declared dependencies, and keeps a misbehaving plugin from taking the host
//! down with it.
//!
//! # Architecture
//!
//! - [`ModuleLoader`] opens a module and resolves its entry points.
//!   [`NativeModuleLoader`] handles shared libraries; [`StaticModuleLoader`]
//!   serves plugins linked into the host.
//! - [`DependencyGraph`] tracks "requires" edges and computes load order.
//! - [`PluginRegistry`] drives each plugin through
//!   `Unloaded -> Loading -> Loaded -> Initializing -> Active`, consulting the
//!   [`SecurityGate`](hostguard_security::SecurityGate) before a module is
//!   opened and again before it is trusted.
//!
//! # Writing a plugin
//!
//! ```ignore
//! use hostguard_plugin::{Plugin, PluginContext, PluginInfo, declare_plugin};
//!
//! #[derive(Default)]
//! struct Viewer;
//!
//! impl Plugin for Viewer {
//!     fn info(&self) -> PluginInfo {
//!         PluginInfo::new("viewer", "0.1.0").depends_on("storage")
//!     }
//!
//!     fn initialize(&mut self, _context: &PluginContext) -> bool {
//!         true
//!     }
//! }
//!
//! declare_plugin!(Viewer, Viewer::default());
//! ```

mod diagnostics;
mod graph;
mod loader;
mod plugin;
mod registry;

pub use diagnostics::{PluginSummary, RegistryDiagnostics};
pub use graph::{DependencyGraph, DependencyNode};
pub use loader::{
    CREATE_SYMBOL, CreateFn, DESTROY_SYMBOL, DestroyFn, EntryPoints, INFO_SYMBOL, InfoFn,
    ModuleLoader, NativeModuleLoader, StaticModuleLoader, module_name,
};
pub use plugin::{
    Capabilities, Capability, MenuItem, MenuProvider, Plugin, PluginContext, PresentationHost,
    WindowDescriptor, WindowProvider,
};
pub use registry::{PluginRegistry, PluginStatus, default_plugin_directory};

pub use hostguard_core::{
    ApiVersion, CURRENT_API_VERSION, PluginConfig, PluginError, PluginErrorType, PluginFault,
    PluginInfo, PluginResult, PluginState,
};
