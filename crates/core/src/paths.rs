//! Path normalization shared by the walker, packer and manifests

use std::path::{Component, Path, PathBuf};

/// Prefix marking a reference as relative to the owning asset's directory
pub const RELATIVE_PREFIX: &[u8] = b"//";

/// Convert a raw reference path into a `PathBuf`
#[must_use]
pub fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt as _;
        PathBuf::from(std::ffi::OsStr::from_bytes(bytes))
    }
    #[cfg(not(unix))]
    {
        PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Lexically normalize a path: drop `.` and fold `..` without touching disk
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Make a path absolute against the working directory and normalize it
///
/// # Errors
/// Returns an error if the working directory cannot be determined
pub fn absolute(path: &Path) -> color_eyre::Result<PathBuf> {
    Ok(normalize(&std::path::absolute(path)?))
}

/// Resolve a reference path found inside an asset living in `basedir`
#[must_use]
pub fn resolve_reference(path: &[u8], basedir: &Path) -> PathBuf {
    let resolved = match path.strip_prefix(RELATIVE_PREFIX) {
        Some(rest) => basedir.join(bytes_to_path(rest)),
        None => basedir.join(bytes_to_path(path)),
    };
    normalize(&resolved)
}

/// Express `path` relative to `base`, walking up with `..` where needed
#[must_use]
pub fn relative_to(path: &Path, base: &Path) -> PathBuf {
    let path = normalize(path);
    let base = normalize(base);

    let mut path_iter = path.components().peekable();
    let mut base_iter = base.components().peekable();
    while let (Some(a), Some(b)) = (path_iter.peek(), base_iter.peek()) {
        if a != b {
            break;
        }
        path_iter.next();
        base_iter.next();
    }

    let mut out = PathBuf::new();
    for _ in base_iter {
        out.push("..");
    }
    for component in path_iter {
        out.push(component.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Render a path the way manifests store it: forward slashes
#[must_use]
pub fn manifest_string(path: &Path) -> String {
    let s = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.into_owned()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

/// Join a client-supplied relative path onto `root`, refusing escapes
#[must_use]
pub fn contained(root: &Path, rel: &str) -> Option<PathBuf> {
    let rel = Path::new(rel);
    if rel.is_absolute() {
        return None;
    }
    let root = normalize(root);
    let joined = normalize(&root.join(rel));
    joined.starts_with(&root).then_some(joined)
}

/// Final component of a path as a string
#[must_use]
pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
