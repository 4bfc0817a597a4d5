//! Module hijacking heuristics.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::error::{SecurityError, SecurityResult};
use crate::path::{is_system_directory, normalize};
use crate::types::HijackThreat;

/// Operating-system modules that should only ever resolve from a system
/// directory.
pub const KNOWN_SYSTEM_MODULES: &[&str] = &[
    "kernel32.dll",
    "kernelbase.dll",
    "user32.dll",
    "advapi32.dll",
    "msvcrt.dll",
    "ntdll.dll",
    "gdi32.dll",
    "shell32.dll",
    "ole32.dll",
    "ws2_32.dll",
    "crypt32.dll",
    "version.dll",
    "libc.so.6",
    "libm.so.6",
    "libdl.so.2",
    "libpthread.so.0",
    "ld-linux-x86-64.so.2",
    "libsystem.b.dylib",
];

/// Environment variables that inject modules ahead of normal resolution.
const PRELOAD_VARIABLES: &[&str] = &["LD_PRELOAD", "DYLD_INSERT_LIBRARIES"];

fn file_name(path: &Path) -> Option<String> {
    let text = normalize(&path.to_string_lossy());
    text.rsplit('/')
        .find(|c| !c.is_empty())
        .map(str::to_ascii_lowercase)
}

/// Look for signs that `path` stands in for a trusted module.
///
/// When `expected` is given, resolving anywhere else is reported as planting.
/// A well-known system module name outside the system directories is
/// reported as side-by-side hijacking when it sits under a local redirection
/// directory, and as search-path hijacking otherwise.
pub fn detect_hijacking(path: &Path, expected: Option<&Path>) -> Option<HijackThreat> {
    if let Some(expected) = expected {
        let actual = normalize(&path.to_string_lossy());
        let expected = normalize(&expected.to_string_lossy());
        let same = if cfg!(windows) {
            actual.eq_ignore_ascii_case(&expected)
        } else {
            actual == expected
        };
        if !same {
            return Some(HijackThreat::ModulePlanting);
        }
    }

    let name = file_name(path)?;
    if !KNOWN_SYSTEM_MODULES.contains(&name.as_str()) || is_system_directory(path) {
        return None;
    }

    let lowered = normalize(&path.to_string_lossy()).to_ascii_lowercase();
    let redirected = lowered
        .split('/')
        .any(|c| c.ends_with(".local") || c == "winsxs" || c.ends_with(".manifest"));
    Some(if redirected {
        HijackThreat::SideBySideHijacking
    } else {
        HijackThreat::SearchPathHijacking
    })
}

/// Compile blocked module name patterns, matched case-insensitively against
/// file names.
pub(crate) fn compile_blocklist(patterns: &[String]) -> SecurityResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| SecurityError::InvalidPolicy(format!("{pattern}: {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| SecurityError::InvalidPolicy(e.to_string()))
}

/// Whether the module's file name matches the blocklist.
pub(crate) fn is_blocked(path: &Path, blocklist: &GlobSet) -> bool {
    file_name(path).is_some_and(|name| blocklist.is_match(name))
}

/// Modules named in the preload environment variables.
pub(crate) fn preload_entries() -> Vec<PathBuf> {
    PRELOAD_VARIABLES
        .iter()
        .filter_map(|var| std::env::var_os(var))
        .flat_map(|value| {
            value
                .to_string_lossy()
                .split([':', ' '])
                .filter(|entry| !entry.is_empty())
                .map(PathBuf::from)
                .collect::<Vec<_>>()
        })
        .collect()
}

#[cfg(target_os = "linux")]
fn mapped_modules() -> Vec<PathBuf> {
    let Ok(maps) = std::fs::read_to_string("/proc/self/maps") else {
        return Vec::new();
    };
    maps.lines()
        .filter_map(|line| line.split_whitespace().nth(5))
        .filter(|path| path.starts_with('/'))
        .map(PathBuf::from)
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn mapped_modules() -> Vec<PathBuf> {
    Vec::new()
}

/// How a blocked module found in the process got there: named in the
/// preload environment, or already mapped.
pub(crate) fn loaded_module_threat(module: &Path, injected: &[PathBuf]) -> HijackThreat {
    if injected.iter().any(|entry| entry == module) {
        HijackThreat::ModuleInjection
    } else {
        HijackThreat::ModulePreloading
    }
}

/// Modules currently mapped into or queued for preloading into the process.
pub fn loaded_modules() -> Vec<PathBuf> {
    let mut modules: BTreeSet<PathBuf> = mapped_modules().into_iter().collect();
    modules.extend(preload_entries());
    modules.into_iter().collect()
}
