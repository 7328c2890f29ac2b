//! Filename and path handling shared by the importer and the extractor.

use crate::{Error, Result};
use std::path::{Path, PathBuf};

/// Characters which cannot appear in a stored entry name, in addition to control bytes.
const INVALID_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// Device names which are rejected regardless of case, with or without an extension.
const RESERVED_NAMES: &[&str] = &["con", "prn", "aux", "nul"];

/// Cleans a user-supplied entry name: strips invalid and control characters, trims surrounding
/// whitespace and dots and rejects reserved device names.
///
/// An empty result is allowed here; callers supply the fallback names.
pub fn clean_filename(name: &str) -> String {
    let cleaned = name
        .chars()
        .filter(|c| !c.is_control() && !INVALID_FILENAME_CHARS.contains(c))
        .collect::<String>();

    let cleaned = cleaned
        .trim_matches(|c: char| c.is_whitespace() || c == '.')
        .to_string();

    if is_reserved_name(&cleaned) {
        return String::new();
    }

    cleaned
}

fn is_reserved_name(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or("");
    let lower = stem.to_ascii_lowercase();

    if RESERVED_NAMES.contains(&lower.as_str()) {
        return true;
    }

    // com0..com9 and lpt0..lpt9
    if lower.len() == 4 && (lower.starts_with("com") || lower.starts_with("lpt")) {
        return lower.as_bytes()[3].is_ascii_digit();
    }

    false
}

/// Fallback for names which cleaned down to nothing. Files keep their original extension when it
/// survives cleaning on its own.
pub(crate) fn fallback_filename(original: &str, is_dir: bool) -> String {
    if is_dir {
        return "unnamed_directory".to_string();
    }

    let extension = original
        .rsplit('.')
        .next()
        .filter(|ext| !ext.is_empty() && *ext != original)
        .map(clean_filename)
        .filter(|ext| !ext.is_empty());

    match extension {
        Some(ext) => format!("unnamed_file.{}", ext),
        None => "unnamed_file".to_string(),
    }
}

/// Cleans an entry name, falling back when nothing survives.
pub(crate) fn clean_or_fallback(original: &str, is_dir: bool) -> String {
    let cleaned = clean_filename(original);
    if cleaned.is_empty() {
        fallback_filename(original, is_dir)
    } else {
        cleaned
    }
}

/// Whether a name read back from a stored directory node can be materialized on disk.
pub(crate) fn has_invalid_filename_chars(name: &str) -> bool {
    name.chars()
        .any(|c| c.is_control() || INVALID_FILENAME_CHARS.contains(&c))
}

/// Lexically cleans a slash-separated path: collapses separators and resolves `.` and `..`
/// without consulting the filesystem.
pub(crate) fn lexical_clean(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut out: Vec<&str> = Vec::new();

    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if out.last().map_or(false, |c| *c != "..") {
                    out.pop();
                } else if !rooted {
                    out.push("..");
                }
            }
            c => out.push(c),
        }
    }

    let joined = out.join("/");
    if rooted {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// A symlink target is acceptable when it is relative and cannot escape the directory tree being
/// extracted: not absolute, and not `..` or `../` leading after cleaning.
pub fn validate_symlink_target(target: &str) -> bool {
    if target.is_empty() || target.starts_with('/') {
        return false;
    }

    let cleaned = lexical_clean(target);
    cleaned != ".." && !cleaned.starts_with("../")
}

/// Resolves to an absolute path and normalizes `.` and `..` lexically, without touching the
/// filesystem.
pub(crate) fn absolutize(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| Error::io(path, e))?
            .join(path)
    };

    Ok(normalize(&joined))
}

fn normalize(path: &Path) -> PathBuf {
    use std::path::Component::*;

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Prefix(prefix) => out.push(prefix.as_os_str()),
            RootDir => out.push(std::path::MAIN_SEPARATOR.to_string()),
            CurDir => {}
            ParentDir => {
                out.pop();
            }
            Normal(c) => out.push(c),
        }
    }
    out
}

/// Whether `path` is `base` or below it, comparing resolved, normalized forms component-wise.
pub fn is_subpath(path: &Path, base: &Path) -> bool {
    match (absolutize(path), absolutize(base)) {
        (Ok(path), Ok(base)) => path == base || path.starts_with(&base),
        // failing to resolve the current directory means we cannot prove containment
        _ => false,
    }
}

/// Verifies that no directory between `base` (exclusive) and `target`'s parent (inclusive) is a
/// symlink. Components which do not exist yet terminate the walk; they will be created fresh.
pub(crate) async fn ensure_no_symlink_in_path(base: &Path, target: &Path) -> Result<()> {
    let parent = match target.parent() {
        Some(parent) => parent,
        None => return Ok(()),
    };

    let relative = match parent.strip_prefix(base) {
        Ok(relative) => relative,
        // outside of base entirely; the subpath check reports this with a better error
        Err(_) => return Ok(()),
    };

    let mut current = base.to_path_buf();
    for component in relative.components() {
        current.push(component);

        match tokio::fs::symlink_metadata(&current).await {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(Error::PathTraversal {
                    path: target.to_path_buf(),
                    base: base.to_path_buf(),
                });
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::io(current.clone(), e)),
        }
    }

    Ok(())
}
