//! Path normalization and load-directory classification.
//!
//! Paths arrive as strings from plugins and from configuration, and may use
//! either separator regardless of the host platform. Everything here works on
//! the textual form so that a Windows-style path is classified the same way on
//! every host.

use std::path::{Path, PathBuf};

/// Upper bound on nested percent-decoding passes.
const MAX_DECODE_PASSES: usize = 4;

/// Directory components that mark a user-writable or scratch location.
const INSECURE_COMPONENTS: &[&str] = &["temp", "tmp", "downloads"];

/// Multi-component locations that are user-writable.
const INSECURE_SEGMENTS: &[&str] = &["/users/public/", "/appdata/local/temp/", "/var/tmp/"];

/// Directory components that identify a system directory.
const SYSTEM_COMPONENTS: &[&str] = &["system32", "syswow64", "winsxs"];

/// Absolute prefixes of system library directories on Unix-like hosts.
const SYSTEM_PREFIXES: &[&str] = &[
    "/lib",
    "/lib32",
    "/lib64",
    "/usr/lib",
    "/usr/lib32",
    "/usr/lib64",
    "/usr/local/lib",
    "/system/library",
];

/// Directory components that identify an installed-application directory.
const APPLICATION_COMPONENTS: &[&str] = &["program files", "program files (x86)", "applications"];

/// Absolute prefixes of installed-application directories on Unix-like hosts.
const APPLICATION_PREFIXES: &[&str] = &["/opt", "/usr/share"];

/// Percent-decode a path until it stops changing.
///
/// Encoded traversal sequences such as `%2e%2e%2f` and double-encoded forms
/// like `%252e%252e` are flattened so later checks see the literal text.
pub fn decode_path(raw: &str) -> String {
    let mut current = raw.to_string();
    for _ in 0..MAX_DECODE_PASSES {
        let decoded = match urlencoding::decode(&current) {
            Ok(text) => text.into_owned(),
            Err(_) => String::from_utf8_lossy(&urlencoding::decode_binary(current.as_bytes()))
                .into_owned(),
        };
        if decoded == current {
            break;
        }
        current = decoded;
    }
    current
}

/// Convert separators to `/` after decoding.
pub(crate) fn normalize(raw: &str) -> String {
    decode_path(raw).replace('\\', "/")
}

/// Lowercased, `/`-separated form used for directory heuristics.
fn comparable(path: &Path) -> String {
    let mut text = normalize(&path.to_string_lossy()).to_lowercase();
    while text.len() > 1 && text.ends_with('/') {
        text.pop();
    }
    text
}

/// Whether a path contains a parent-directory reference or an embedded NUL.
///
/// The check runs on the decoded text and splits on both separators.
pub fn is_path_traversal(raw: &str) -> bool {
    let decoded = decode_path(raw);
    if decoded.contains('\0') {
        return true;
    }
    decoded.split(['/', '\\']).any(|component| component == "..")
}

/// Whether `path` lies inside `dir`, comparing textually.
fn is_within(path: &str, dir: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        return path.starts_with('/');
    }
    path == dir
        || path
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

fn has_component(path: &str, names: &[&str]) -> bool {
    components(path).any(|c| names.contains(&c))
}

fn has_prefix(path: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|prefix| is_within(path, prefix))
}

fn is_insecure(path: &str) -> bool {
    let bracketed = format!("{path}/");
    has_component(path, INSECURE_COMPONENTS)
        || INSECURE_SEGMENTS.iter().any(|s| bracketed.contains(s))
}

/// Whether the path is inside a recognized operating-system directory.
pub fn is_system_directory(path: &Path) -> bool {
    let path = comparable(path);
    has_component(&path, SYSTEM_COMPONENTS) || has_prefix(&path, SYSTEM_PREFIXES)
}

fn is_application_directory(path: &str) -> bool {
    has_component(path, APPLICATION_COMPONENTS) || has_prefix(path, APPLICATION_PREFIXES)
}

/// Classify the directory a module would be loaded from.
///
/// Configured trusted directories always win. Otherwise scratch and
/// user-writable locations are insecure, recognized system and application
/// directories are secure, and anything else is insecure.
pub fn is_secure_load_path(path: &Path, trusted: &[PathBuf]) -> bool {
    let text = comparable(path);
    if text.is_empty() || is_path_traversal(&text) {
        return false;
    }

    if trusted
        .iter()
        .any(|dir| is_within(&text, &comparable(dir)))
    {
        return true;
    }

    if is_insecure(&text) {
        return false;
    }

    is_system_directory(path) || is_application_directory(&text)
}
