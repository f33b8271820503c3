//! Path handling for writer-declared locations.
//!
//! Writers declare directories as strings in their own platform's notation
//! (`C:\Data`, `\\host\share\dir`, `/srv/data`). Comparisons treat `\` and `/`
//! as equivalent separators and ignore ASCII case; conversion to a native
//! [`PathBuf`] only happens at the filesystem boundary.

pub mod mirror;
mod resolver;
pub mod volume;
pub mod wildcard;

pub use mirror::{mirror_path, SaveArea};
pub use resolver::{
    DestinationOrigin, DestinationRule, PathResolver, ResolvedDestination, ResolvedSource, SnapshotMap,
};
pub use volume::{Volume, VolumeError, VolumeResolver};

use std::path::PathBuf;

/// Split a declared path into its non-empty segments.
pub fn segments(path: &str) -> Vec<&str> {
    path.split(['\\', '/']).filter(|s| !s.is_empty()).collect()
}

/// Case-insensitive, separator-insensitive path equality.
pub fn same_path(a: &str, b: &str) -> bool {
    let a = segments(a);
    let b = segments(b);
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.eq_ignore_ascii_case(y))
}

/// If `prefix` is a leading run of `path`'s segments, return the remaining segments.
pub fn strip_prefix<'a>(prefix: &str, path: &'a str) -> Option<Vec<&'a str>> {
    let prefix = segments(prefix);
    let path = segments(path);
    if prefix.len() > path.len() {
        return None;
    }
    if prefix
        .iter()
        .zip(path.iter())
        .all(|(p, s)| p.eq_ignore_ascii_case(s))
    {
        Some(path[prefix.len()..].to_vec())
    } else {
        None
    }
}

/// The separator a declared path uses, `\` unless it only contains `/`.
pub fn separator_of(path: &str) -> char {
    if path.contains('\\') || (!path.contains('/') && looks_like_windows(path)) {
        '\\'
    } else {
        '/'
    }
}

fn looks_like_windows(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}

/// Append segments to `base`, keeping `base`'s separator style.
pub fn join(base: &str, rest: &[&str]) -> String {
    let separator = separator_of(base);
    let mut joined = base.trim_end_matches(['\\', '/']).to_string();
    if joined.is_empty() && base.starts_with(['\\', '/']) {
        joined.push(separator);
        joined.push_str(&rest.join(&separator.to_string()));
        return joined;
    }
    for segment in rest {
        joined.push(separator);
        joined.push_str(segment);
    }
    joined
}

/// Expand `%NAME%` placeholders from the process environment.
///
/// Unknown names are left verbatim so the failure surfaces as a missing path
/// rather than a silently different one.
pub fn expand_env(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut rest = path;

    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(end) if end > 0 => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => {
                        out.push('%');
                        out.push_str(name);
                        out.push('%');
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push('%');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Convert a declared path into a path usable on this platform.
pub fn to_native(path: &str) -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(path)
    } else {
        PathBuf::from(path.replace('\\', "/"))
    }
}

/// Split `dir\filespec` at the final separator.
pub fn split_last(path: &str) -> Option<(&str, &str)> {
    let index = path.rfind(['\\', '/'])?;
    Some((&path[..index], &path[index + 1..]))
}
