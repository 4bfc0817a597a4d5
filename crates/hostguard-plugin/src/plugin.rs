//! The plugin trait and the surfaces a plugin can expose to the host.
//!
//! A module exports its plugin through [`declare_plugin!`], which emits the
//! three entry points the loader resolves. Optional presentation surfaces
//! (windows and menus) are advertised through [`Plugin::capabilities`] and
//! reached through typed accessors, so the host never inspects a plugin by
//! guessing at its type.

use std::collections::BTreeSet;
use std::sync::Arc;

use hostguard_core::{PluginConfig, PluginInfo};
use hostguard_security::{FileAccessType, SecurityGate};
use serde::{Deserialize, Serialize};

/// Optional surface a plugin can provide.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum Capability {
    /// Receives `update` ticks.
    Update,
    /// Receives `render` calls.
    Render,
    /// Provides windows through [`Plugin::window_provider`].
    Window,
    /// Provides menu items through [`Plugin::menu_provider`].
    Menu,
}

/// Set of capabilities a plugin declares.
pub type Capabilities = BTreeSet<Capability>;

/// What the host hands a plugin during initialization.
#[derive(Debug, Clone)]
pub struct PluginContext {
    name: String,
    config: PluginConfig,
    gate: Arc<SecurityGate>,
}

impl PluginContext {
    pub(crate) fn new(name: impl Into<String>, config: PluginConfig, gate: Arc<SecurityGate>) -> Self {
        Self {
            name: name.into(),
            config,
            gate,
        }
    }

    /// Registry name of the plugin being initialized.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// Free-form parameter from the plugin's configuration section.
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.config.parameter(key)
    }

    /// Ask the security gate whether this plugin may touch `path`.
    ///
    /// The plugin's name is passed as the requester, so policies that list
    /// trusted requesters apply.
    pub fn check_file_access(&self, path: &str, access: FileAccessType) -> bool {
        self.gate.check_file_access_as(path, access, &self.name)
    }

    /// The gate itself, for plugins that need more than file checks.
    pub fn security(&self) -> &Arc<SecurityGate> {
        &self.gate
    }
}

/// A loaded plugin instance.
///
/// Every hook runs inside a fault boundary: a panic is caught by the registry
/// and moves the plugin to the error state instead of unwinding into the host.
/// Hooks must not call back into the registry that owns the plugin.
pub trait Plugin: Send {
    /// Static metadata: name, version, dependencies and interface version.
    fn info(&self) -> PluginInfo;

    /// Prepare the plugin. Returning `false` aborts the load.
    fn initialize(&mut self, context: &PluginContext) -> bool;

    /// Release resources before the instance is destroyed.
    fn shutdown(&mut self) {}

    /// Advance the plugin by `delta_seconds`.
    fn update(&mut self, _delta_seconds: f32) {}

    fn render(&mut self) {}

    /// Surfaces this plugin provides. Only declared hooks are called.
    fn capabilities(&self) -> Capabilities {
        [Capability::Update, Capability::Render].into_iter().collect()
    }

    fn window_provider(&mut self) -> Option<&mut dyn WindowProvider> {
        None
    }

    fn menu_provider(&mut self) -> Option<&mut dyn MenuProvider> {
        None
    }
}

/// A window a plugin wants the front end to host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowDescriptor {
    /// Identifier unique within the plugin.
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub open_by_default: bool,
}

impl WindowDescriptor {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            open_by_default: false,
        }
    }
}

/// A menu entry a plugin wants the front end to show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItem {
    /// Identifier unique within the plugin.
    pub id: String,
    /// Top-level menu the item belongs under, e.g. `"Tools"`.
    pub menu: String,
    pub label: String,
    #[serde(default)]
    pub shortcut: Option<String>,
}

impl MenuItem {
    pub fn new(id: impl Into<String>, menu: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            menu: menu.into(),
            label: label.into(),
            shortcut: None,
        }
    }

    pub fn with_shortcut(mut self, shortcut: impl Into<String>) -> Self {
        self.shortcut = Some(shortcut.into());
        self
    }
}

/// Window surface of a plugin.
pub trait WindowProvider {
    fn windows(&self) -> Vec<WindowDescriptor>;

    /// Draw the window with the given id.
    fn draw_window(&mut self, id: &str);
}

/// Menu surface of a plugin.
pub trait MenuProvider {
    fn menu_items(&self) -> Vec<MenuItem>;

    /// Called when the user activates the item with the given id.
    fn on_menu_action(&mut self, id: &str);
}

/// Front-end side of presentation integration.
///
/// [`PluginRegistry::integrate`](crate::PluginRegistry::integrate) walks the
/// active plugins and hands their windows and menu items to this host.
pub trait PresentationHost {
    fn register_window(&mut self, plugin: &str, window: WindowDescriptor);

    fn register_menu_item(&mut self, plugin: &str, item: MenuItem);
}

/// Export a plugin type from a module.
///
/// Emits `hostguard_create_plugin`, `hostguard_destroy_plugin` and
/// `hostguard_plugin_info`. The module and the host must be built with the
/// same compiler, since the entry points use the Rust ABI.
///
/// ```ignore
/// hostguard_plugin::declare_plugin!(Viewer, Viewer::default());
/// ```
#[macro_export]
macro_rules! declare_plugin {
    ($plugin:ty, $constructor:expr) => {
        #[unsafe(no_mangle)]
        pub fn hostguard_create_plugin() -> ::std::boxed::Box<dyn $crate::Plugin> {
            let plugin: $plugin = $constructor;
            ::std::boxed::Box::new(plugin)
        }

        #[unsafe(no_mangle)]
        pub fn hostguard_destroy_plugin(plugin: ::std::boxed::Box<dyn $crate::Plugin>) {
            drop(plugin);
        }

        #[unsafe(no_mangle)]
        pub fn hostguard_plugin_info() -> $crate::PluginInfo {
            let plugin: $plugin = $constructor;
            $crate::Plugin::info(&plugin)
        }
    };
}
