//! Module loading.
//!
//! The registry only needs three things from a loader: open a module by path,
//! resolve its entry points, and close it again. [`NativeModuleLoader`] does
//! this for shared libraries with `libloading`; [`StaticModuleLoader`] serves
//! entry points that are compiled into the host.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use hostguard_core::{HandleTable, ModuleHandle, PluginError, PluginInfo, PluginResult};
use libloading::Library;
use parking_lot::Mutex;

use crate::plugin::Plugin;

/// Creates a plugin instance. Mandatory.
pub type CreateFn = fn() -> Box<dyn Plugin>;

/// Destroys an instance created by the same module.
pub type DestroyFn = fn(Box<dyn Plugin>);

/// Reports plugin metadata without creating an instance.
pub type InfoFn = fn() -> PluginInfo;

pub const CREATE_SYMBOL: &str = "hostguard_create_plugin";
pub const DESTROY_SYMBOL: &str = "hostguard_destroy_plugin";
pub const INFO_SYMBOL: &str = "hostguard_plugin_info";

/// Entry points resolved from an open module.
///
/// The function pointers are only valid while the module stays open.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryPoints {
    pub create: Option<CreateFn>,
    pub destroy: Option<DestroyFn>,
    pub info: Option<InfoFn>,
}

impl EntryPoints {
    /// Entry points with only the mandatory creation function.
    pub fn new(create: CreateFn) -> Self {
        Self {
            create: Some(create),
            destroy: None,
            info: None,
        }
    }

    pub fn with_destroy(mut self, destroy: DestroyFn) -> Self {
        self.destroy = Some(destroy);
        self
    }

    pub fn with_info(mut self, info: InfoFn) -> Self {
        self.info = Some(info);
        self
    }
}

/// Opens and closes modules for the registry.
pub trait ModuleLoader: Send + Sync {
    /// Open the module at `path`.
    fn open(&self, path: &Path) -> PluginResult<ModuleHandle>;

    /// Resolve the entry points of an open module. Missing optional entry
    /// points are `None`, not errors.
    fn entry_points(&self, handle: ModuleHandle) -> PluginResult<EntryPoints>;

    /// Close a module. Every instance it created must be gone by now.
    fn close(&self, handle: ModuleHandle) -> PluginResult<()>;

    /// Number of modules currently open.
    fn open_count(&self) -> usize;
}

/// Registry name for a module path: the file stem.
pub fn module_name(path: &Path) -> Option<String> {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
}

fn load_failed(path: &Path, message: impl Into<String>) -> PluginError {
    PluginError::LoadFailed {
        name: module_name(path).unwrap_or_else(|| path.display().to_string()),
        message: message.into(),
    }
}

/// Loads shared libraries from disk.
#[derive(Debug, Default)]
pub struct NativeModuleLoader {
    libraries: Mutex<HandleTable<Library>>,
}

impl NativeModuleLoader {
    pub fn new() -> Self {
        Self {
            libraries: Mutex::new(HandleTable::new()),
        }
    }
}

impl ModuleLoader for NativeModuleLoader {
    fn open(&self, path: &Path) -> PluginResult<ModuleHandle> {
        // SAFETY: running a module's initializers is the point of loading it;
        // the security gate has vetted the path before we get here.
        let library = unsafe { Library::new(path) }.map_err(|e| load_failed(path, e.to_string()))?;
        let handle = self.libraries.lock().insert(library);
        tracing::debug!(target: "plugin_registry", path = %path.display(), %handle, "Module opened");
        Ok(handle)
    }

    fn entry_points(&self, handle: ModuleHandle) -> PluginResult<EntryPoints> {
        let libraries = self.libraries.lock();
        let library = libraries.get(handle).ok_or(PluginError::StaleHandle)?;

        // SAFETY: the symbols are emitted by `declare_plugin!` with exactly
        // these signatures. The copied pointers stay valid until `close`.
        unsafe {
            Ok(EntryPoints {
                create: library
                    .get::<CreateFn>(CREATE_SYMBOL.as_bytes())
                    .ok()
                    .map(|symbol| *symbol),
                destroy: library
                    .get::<DestroyFn>(DESTROY_SYMBOL.as_bytes())
                    .ok()
                    .map(|symbol| *symbol),
                info: library
                    .get::<InfoFn>(INFO_SYMBOL.as_bytes())
                    .ok()
                    .map(|symbol| *symbol),
            })
        }
    }

    fn close(&self, handle: ModuleHandle) -> PluginResult<()> {
        let library = self
            .libraries
            .lock()
            .remove(handle)
            .ok_or(PluginError::StaleHandle)?;
        library.close().map_err(|e| PluginError::LoadFailed {
            name: handle.to_string(),
            message: e.to_string(),
        })?;
        tracing::debug!(target: "plugin_registry", %handle, "Module closed");
        Ok(())
    }

    fn open_count(&self) -> usize {
        self.libraries.lock().len()
    }
}

/// Serves entry points compiled into the host, keyed by module path.
///
/// Paths still have to exist on disk so the security gate can inspect them.
#[derive(Debug, Default)]
pub struct StaticModuleLoader {
    modules: Mutex<HashMap<PathBuf, EntryPoints>>,
    open: Mutex<HandleTable<EntryPoints>>,
}

impl StaticModuleLoader {
    pub fn new() -> Self {
        Self {
            modules: Mutex::new(HashMap::new()),
            open: Mutex::new(HandleTable::new()),
        }
    }

    /// Make `entry_points` available under `path`, replacing any earlier
    /// registration.
    pub fn register(&self, path: impl Into<PathBuf>, entry_points: EntryPoints) {
        self.modules.lock().insert(path.into(), entry_points);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_module(self, path: impl Into<PathBuf>, entry_points: EntryPoints) -> Self {
        self.register(path, entry_points);
        self
    }

    pub fn is_registered(&self, path: &Path) -> bool {
        self.modules.lock().contains_key(path)
    }
}

impl ModuleLoader for StaticModuleLoader {
    fn open(&self, path: &Path) -> PluginResult<ModuleHandle> {
        let entry_points = self
            .modules
            .lock()
            .get(path)
            .copied()
            .ok_or_else(|| load_failed(path, "no module registered for this path"))?;
        Ok(self.open.lock().insert(entry_points))
    }

    fn entry_points(&self, handle: ModuleHandle) -> PluginResult<EntryPoints> {
        self.open
            .lock()
            .get(handle)
            .copied()
            .ok_or(PluginError::StaleHandle)
    }

    fn close(&self, handle: ModuleHandle) -> PluginResult<()> {
        self.open
            .lock()
            .remove(handle)
            .map(|_| ())
            .ok_or(PluginError::StaleHandle)
    }

    fn open_count(&self) -> usize {
        self.open.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginContext;

    struct Sample;

    impl Plugin for Sample {
        fn info(&self) -> PluginInfo {
            PluginInfo::new("sample", "1.0.0")
        }

        fn initialize(&mut self, _context: &PluginContext) -> bool {
            true
        }
    }

    fn create_sample() -> Box<dyn Plugin> {
        Box::new(Sample)
    }

    #[test]
    fn test_module_name() {
        assert_eq!(module_name(Path::new("/plugins/viewer.so")).as_deref(), Some("viewer"));
        assert_eq!(module_name(Path::new("viewer")).as_deref(), Some("viewer"));
        assert_eq!(module_name(Path::new("/")), None);
    }

    #[test]
    fn test_static_open_close() {
        let loader = StaticModuleLoader::new()
            .with_module("/plugins/sample.so", EntryPoints::new(create_sample));

        let handle = loader.open(Path::new("/plugins/sample.so")).unwrap();
        assert_eq!(loader.open_count(), 1);

        let entry_points = loader.entry_points(handle).unwrap();
        let plugin = (entry_points.create.unwrap())();
        assert_eq!(plugin.info().name, "sample");
        assert!(entry_points.destroy.is_none());

        loader.close(handle).unwrap();
        assert_eq!(loader.open_count(), 0);
        assert!(matches!(loader.entry_points(handle), Err(PluginError::StaleHandle)));
        assert!(matches!(loader.close(handle), Err(PluginError::StaleHandle)));
    }

    #[test]
    fn test_static_unknown_path() {
        let loader = StaticModuleLoader::new();
        let err = loader.open(Path::new("/plugins/missing.so")).unwrap_err();
        assert!(matches!(err, PluginError::LoadFailed { ref name, .. } if name == "missing"));
    }

    #[test]
    fn test_native_open_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_a_library.so");
        std::fs::write(&path, b"plain text").unwrap();

        let loader = NativeModuleLoader::new();
        assert!(matches!(loader.open(&path), Err(PluginError::LoadFailed { .. })));
        assert_eq!(loader.open_count(), 0);
    }
}
