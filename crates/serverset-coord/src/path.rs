//! Helpers for the `/`-separated hierarchical namespace.

use crate::error::{CoordError, CoordResult};

/// Width of the zero-padded counter appended to sequential node names.
pub const SEQUENCE_WIDTH: usize = 10;

/// Check that `path` is absolute, has no empty segments and no trailing
/// slash (the root `/` excepted).
pub fn validate_path(path: &str) -> CoordResult<()> {
    if !path.starts_with('/') {
        return Err(CoordError::InvalidPath(format!("{path} is not absolute")));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(CoordError::InvalidPath(format!("{path} has a trailing slash")));
    }
    if path[1..].split('/').any(|segment| segment.is_empty()) {
        return Err(CoordError::InvalidPath(format!("{path} has an empty segment")));
    }
    Ok(())
}

/// Append `child` to `parent`.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Parent of `path`, or `None` for the root.
pub fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Final segment of `path`.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Parse the sequence suffix of a sequential node name.
pub fn sequence_of(name: &str) -> Option<u64> {
    if name.len() < SEQUENCE_WIDTH {
        return None;
    }
    let suffix = name.get(name.len() - SEQUENCE_WIDTH..)?;
    if !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Build a sequential node name from a prefix and counter value.
pub fn sequential_name(prefix: &str, sequence: u64) -> String {
    format!("{prefix}{sequence:0width$}", width = SEQUENCE_WIDTH)
}
