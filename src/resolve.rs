//! Executable lookup against the search path.

use crate::env::Environment;
use crate::error::{PipelineError, Result};
use std::borrow::Cow;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const SEPARATOR: char = '/';

/// Resolve a command name the way the pipeline builder needs it.
///
/// Behavior:
/// - Absolute path (starts with `/`): returned unchanged, existence is not checked.
/// - Bare name: each directory of the environment's `PATH` is listed in order and the first
///   one holding an entry with exactly that name wins.
/// - Unset `PATH`, no matching entry, or a name that can never be a file name: `Resolution`.
///
/// A directory that cannot be opened counts as "no match here" and the search moves on.
pub fn resolve(env: &Environment, name: &str) -> Result<PathBuf> {
    let not_found = || PipelineError::Resolution {
        command: name.to_string(),
    };

    let search_paths = match env.search_path() {
        Some(paths) => paths,
        None if is_absolute(name) => Default::default(),
        None => return Err(not_found()),
    };

    let found = find_command_path(&search_paths, name).ok_or_else(not_found)?;
    debug!(command = name, path = %found.display(), "resolved executable");
    Ok(found.into_owned())
}

/// Locate `name` in `search_paths` (a `:` separated list of directories).
///
/// Returns either a borrowed path for absolute names or an owned `PathBuf` when the result
/// is discovered through the search path.
pub fn find_command_path<'a>(search_paths: &OsStr, name: &'a str) -> Option<Cow<'a, Path>> {
    if name.contains('\0') {
        return None;
    }
    if is_absolute(name) {
        return Some(Cow::Borrowed(Path::new(name)));
    }
    if name.is_empty() || name.contains(SEPARATOR) {
        // Directory entries never contain a separator.
        return None;
    }
    find_in_path(search_paths, OsStr::new(name)).map(Cow::Owned)
}

/// The part of `path` after the final `/`, or all of it when there is none.
///
/// An empty string yields an empty string.
pub fn base_name(path: &str) -> &str {
    match path.rfind(SEPARATOR) {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

fn is_absolute(name: &str) -> bool {
    name.starts_with(SEPARATOR)
}

fn find_in_path(search_paths: &OsStr, cmd: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(search_paths).find_map(|dir| find_in_dir(&dir, cmd))
}

fn find_in_dir(dir: &Path, cmd: &OsStr) -> Option<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "skipping unreadable search directory");
            return None;
        }
    };
    entries
        .filter_map(|entry| entry.ok())
        .find(|entry| entry.file_name() == cmd)
        .map(|_| dir.join(cmd))
}
