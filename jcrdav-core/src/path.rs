//! Absolute repository path helpers.
//!
//! Paths are `/`-separated, start at the workspace root `/` and never carry a
//! trailing slash (except the root itself).

use crate::error::{Error, Result};

pub const ROOT: &str = "/";

/// Normalize an absolute path: resolves `.` and `..`, drops trailing slashes
/// and validates each segment.
pub fn normalize(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(Error::InvalidPath(format!("not an absolute path: '{}'", path)));
    }

    let mut segments: Vec<&str> = Vec::new();
    let trimmed = path.trim_end_matches('/');
    for (i, segment) in trimmed.split('/').enumerate() {
        if i == 0 {
            continue;
        }
        match segment {
            "" => {
                return Err(Error::InvalidPath(format!("empty segment in '{}'", path)));
            }
            "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(Error::InvalidPath(format!("'{}' escapes the root", path)));
                }
            }
            _ => {
                validate_segment(segment, path)?;
                segments.push(segment);
            }
        }
    }

    if segments.is_empty() {
        return Ok(ROOT.to_string());
    }
    Ok(format!("/{}", segments.join("/")))
}

/// Resolve `path` against `base` when relative, then normalize.
pub fn absolute(base: &str, path: &str) -> Result<String> {
    if path.starts_with('/') {
        return normalize(path);
    }
    normalize(&join(base, path))
}

/// Validate a single item name (no slashes).
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(Error::InvalidPath(format!("invalid item name '{}'", name)));
    }
    validate_segment(name, name)
}

fn validate_segment(segment: &str, path: &str) -> Result<()> {
    let (name, index) = match segment.find('[') {
        Some(pos) => (&segment[..pos], Some(&segment[pos..])),
        None => (segment, None),
    };

    if let Some(index) = index {
        let digits = index
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or("");
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::InvalidPath(format!("bad same-name index in '{}'", path)));
        }
    }

    if name.is_empty() {
        return Err(Error::InvalidPath(format!("empty name in '{}'", path)));
    }
    if name.chars().any(|c| c.is_control() || matches!(c, '*' | '|' | '[' | ']')) {
        return Err(Error::InvalidPath(format!("illegal character in '{}'", path)));
    }
    if name.matches(':').count() > 1 || name.starts_with(':') || name.ends_with(':') {
        return Err(Error::InvalidPath(format!("malformed prefixed name in '{}'", path)));
    }
    Ok(())
}

/// Parent path of an absolute path. The root is its own parent.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => ROOT,
        Some(pos) => &path[..pos],
    }
}

/// Last segment of an absolute path; empty for the root.
pub fn name(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

pub fn join(parent: &str, name: &str) -> String {
    if parent == ROOT {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Number of segments below the root.
pub fn depth(path: &str) -> usize {
    if path == ROOT {
        0
    } else {
        path.matches('/').count()
    }
}

/// True if `path` lies strictly below `ancestor`.
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor == ROOT {
        return path != ROOT;
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// True if `path` equals `ancestor` or lies below it.
pub fn is_self_or_descendant(path: &str, ancestor: &str) -> bool {
    path == ancestor || is_descendant(path, ancestor)
}

/// Proper ancestors of `path`, nearest first, ending with the root.
pub fn ancestors(path: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut current = path;
    while current != ROOT {
        current = parent(current);
        out.push(current);
    }
    out
}

/// Rewrite `path` from below `old_prefix` to below `new_prefix`.
pub fn rebase(path: &str, old_prefix: &str, new_prefix: &str) -> String {
    if path == old_prefix {
        return new_prefix.to_string();
    }
    let rest = &path[old_prefix.len()..];
    if new_prefix == ROOT {
        rest.to_string()
    } else {
        format!("{}{}", new_prefix, rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/").unwrap(), "/");
        assert_eq!(normalize("/a/b/").unwrap(), "/a/b");
        assert_eq!(normalize("/a/./b/../c").unwrap(), "/a/c");
        assert_eq!(normalize("/jcr:content").unwrap(), "/jcr:content");
        assert_eq!(normalize("/a[2]/b").unwrap(), "/a[2]/b");
        assert!(normalize("a/b").is_err());
        assert!(normalize("/a//b").is_err());
        assert!(normalize("/..").is_err());
        assert!(normalize("/a*").is_err());
        assert!(normalize("/a[x]").is_err());
        assert!(normalize("/a:b:c").is_err());
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent("/a/b"), "/a");
        assert_eq!(parent("/a"), "/");
        assert_eq!(parent("/"), "/");
        assert_eq!(name("/a/b"), "b");
        assert_eq!(name("/"), "");
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
    }

    #[test]
    fn test_descendants() {
        assert!(is_descendant("/a/b", "/a"));
        assert!(is_descendant("/a", "/"));
        assert!(!is_descendant("/ab", "/a"));
        assert!(!is_descendant("/a", "/a"));
        assert!(is_self_or_descendant("/a", "/a"));
        assert_eq!(ancestors("/a/b/c"), vec!["/a/b", "/a", "/"]);
        assert_eq!(depth("/a/b"), 2);
        assert_eq!(rebase("/a/b/c", "/a/b", "/x"), "/x/c");
        assert_eq!(rebase("/a/b", "/a/b", "/x"), "/x");
    }

    #[test]
    fn test_absolute() {
        assert_eq!(absolute("/a", "b/c").unwrap(), "/a/b/c");
        assert_eq!(absolute("/a", "../b").unwrap(), "/b");
        assert_eq!(absolute("/a", "/z").unwrap(), "/z");
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(segments in proptest::collection::vec("[a-z]{1,8}", 0..6)) {
            let path = format!("/{}", segments.join("/"));
            let once = normalize(&path).unwrap();
            prop_assert_eq!(normalize(&once).unwrap(), once.clone());
            prop_assert_eq!(depth(&once), segments.len());
        }

        #[test]
        fn parent_of_join_is_identity(segments in proptest::collection::vec("[a-z]{1,8}", 0..5), leaf in "[a-z]{1,8}") {
            let base = normalize(&format!("/{}", segments.join("/"))).unwrap();
            let child = join(&base, &leaf);
            prop_assert_eq!(parent(&child), base.as_str());
            prop_assert_eq!(name(&child), leaf.as_str());
            prop_assert!(is_descendant(&child, &base));
        }
    }
}
