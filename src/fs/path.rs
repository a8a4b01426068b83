//! Virtual path helpers
//!
//! Paths inside the provider are absolute, `/`-separated and never end with a
//! separator, except the root which is `/`. Everything that keys a cache goes
//! through `normalize` first.

pub const ROOT: &str = "/";

/// Normalize a path for consistent lookup
///
/// Accepts `\` separators, repeated separators and trailing separators.
pub fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path
        .split(['/', '\\'])
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    if parts.is_empty() {
        return ROOT.to_string();
    }
    let mut out = String::with_capacity(path.len() + 1);
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    out
}

pub fn is_root(path: &str) -> bool {
    path == ROOT
}

/// Parent path of a normalized path (the root is its own parent)
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => ROOT,
        Some(idx) => &path[..idx],
    }
}

/// Last component of a normalized path (empty for the root)
pub fn name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

pub fn join(dir: &str, name: &str) -> String {
    if is_root(dir) {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Whether `path` lies strictly beneath `dir`
pub fn is_descendant(path: &str, dir: &str) -> bool {
    if is_root(dir) {
        return !is_root(path);
    }
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}
