//! Script location handling and call-frame based path introspection.

use crate::runtime::error::ContextError;
use deno_core::ModuleSpecifier;
use std::path::{Component, Path, PathBuf};

/// Lexically normalize `path`: drop `.` segments and fold `..` into the
/// preceding segment. Symlinks are not resolved.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for part in path.components() {
        match part {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(std::path::MAIN_SEPARATOR_STR)),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(seg) => out.push(seg),
        }
    }
    out
}

/// Make `path` absolute against the process working directory and normalize it.
pub fn absolute_path(path: &Path) -> Result<PathBuf, ContextError> {
    if path.is_absolute() {
        return Ok(normalize_path(path));
    }
    let cwd = std::env::current_dir().map_err(|err| ContextError::Resource {
        path: path.to_path_buf(),
        reason: format!("cannot resolve against working directory: {}", err),
    })?;
    Ok(normalize_path(&cwd.join(path)))
}

pub fn file_url(path: &Path) -> Result<ModuleSpecifier, ContextError> {
    ModuleSpecifier::from_file_path(path).map_err(|()| {
        ContextError::validation(format!("'{}' cannot be expressed as a file URL", path.display()))
    })
}

/// Turn a script location (plain path or `file:` URI) into an absolute,
/// normalized path. Existence is not checked.
pub fn path_from_location(location: &str) -> Result<PathBuf, ContextError> {
    if location.trim().is_empty() {
        return Err(ContextError::validation("script location cannot be empty"));
    }

    if location.starts_with("file:") {
        let url = ModuleSpecifier::parse(location).map_err(|err| {
            ContextError::validation(format!("invalid file URL '{}': {}", location, err))
        })?;
        let path = url.to_file_path().map_err(|()| {
            ContextError::validation(format!("'{}' does not name a local file", location))
        })?;
        return Ok(normalize_path(&path));
    }

    absolute_path(Path::new(location))
}

/// Pick the script currently being evaluated from a list of call-frame
/// sources, newest first.
///
/// Frames from built-in bindings (`ext:` sources), inline evaluations and
/// native code are skipped.
pub fn resolve_current_script(frames: &[String]) -> Result<PathBuf, ContextError> {
    if frames.is_empty() {
        return Err(ContextError::Unsupported(
            "call-frame introspection".to_string(),
        ));
    }

    frames
        .iter()
        .find_map(|frame| user_script_path(frame))
        .ok_or_else(|| ContextError::validation("no user script on the current call stack"))
}

fn user_script_path(frame: &str) -> Option<PathBuf> {
    let frame = frame.trim();
    if frame.starts_with("file:") {
        let url = ModuleSpecifier::parse(frame).ok()?;
        return url.to_file_path().ok().map(|path| normalize_path(&path));
    }

    let path = Path::new(frame);
    if path.is_absolute() {
        return Some(normalize_path(path));
    }
    None
}
