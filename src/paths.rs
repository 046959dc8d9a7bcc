//! Path parsing helpers.
//!
//! Paths are absolute, '/'-separated, with no empty components past the
//! leading root and components of at most 255 bytes. The resolver walks the
//! components against directory inodes; "." and ".." are not stored in
//! directories and are rejected here rather than resolved structurally.

use crate::error::{FsResult, PathError};
use crate::MAX_FILENAME;

/// Check that `name` is usable as a single directory entry name.
pub fn validate_name(name: &str) -> FsResult<()> {
    if name.is_empty() {
        return Err(PathError::InvalidPath("empty name".into()).into());
    }
    if name.len() > MAX_FILENAME {
        return Err(PathError::InvalidPath(format!("name too long: {} bytes", name.len())).into());
    }
    if name.contains(['/', '\0']) {
        return Err(PathError::InvalidPath(format!("illegal character in {:?}", name)).into());
    }
    if name == "." || name == ".." {
        return Err(PathError::InvalidPath(format!("reserved name {:?}", name)).into());
    }
    Ok(())
}

/// Validate a full path and split it into components. The root path "/"
/// yields no components.
pub fn components(path: &str) -> FsResult<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(PathError::InvalidPath(format!("not absolute: {:?}", path)).into());
    }
    if path == "/" {
        return Ok(Vec::new());
    }
    let mut parts = Vec::new();
    for part in path[1..].split('/') {
        validate_name(part)?;
        parts.push(part);
    }
    Ok(parts)
}

/// True when the path is syntactically valid.
pub fn validate(path: &str) -> FsResult<()> {
    components(path).map(|_| ())
}

/// Split a path into its parent path and final component. Fails on "/"
/// since the root has no parent.
pub fn split_parent(path: &str) -> FsResult<(String, &str)> {
    let parts = components(path)?;
    let name = *parts
        .last()
        .ok_or_else(|| PathError::InvalidPath("root has no parent".into()))?;
    let parent = if parts.len() == 1 {
        "/".to_string()
    } else {
        format!("/{}", parts[..parts.len() - 1].join("/"))
    };
    Ok((parent, name))
}

/// Final component of a path, if any.
pub fn filename(path: &str) -> FsResult<Option<&str>> {
    Ok(components(path)?.last().copied())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root() {
        assert!(components("/").unwrap().is_empty());
        assert!(validate("/").is_ok());
        assert!(split_parent("/").is_err());
    }

    #[test]
    fn test_components() {
        assert_eq!(components("/a").unwrap(), vec!["a"]);
        assert_eq!(components("/a/b/c").unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(components("a/b").is_err());
        assert!(components("").is_err());
        assert!(components("//a").is_err());
        assert!(components("/a//b").is_err());
        assert!(components("/a/").is_err());
        assert!(components("/a/./b").is_err());
        assert!(components("/a/../b").is_err());
        assert!(components("/a\0b").is_err());
    }

    #[test]
    fn test_component_length_limit() {
        let long = "x".repeat(MAX_FILENAME);
        assert!(validate(&format!("/{}", long)).is_ok());
        let too_long = "x".repeat(MAX_FILENAME + 1);
        assert!(validate(&format!("/{}", too_long)).is_err());
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(split_parent("/a").unwrap(), ("/".to_string(), "a"));
        assert_eq!(split_parent("/a/b/c").unwrap(), ("/a/b".to_string(), "c"));
    }

    #[test]
    fn test_filename() {
        assert_eq!(filename("/").unwrap(), None);
        assert_eq!(filename("/a/b").unwrap(), Some("b"));
    }
}
