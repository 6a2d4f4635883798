//! Path Helpers
//!
//! Pure string algebra over sandbox paths. Nothing here touches the node
//! table; resolution against the working directory happens in the VFS.

/// Collapse `.` and `..` components. `allow_above_root` keeps surplus `..`
/// components instead of dropping them (relative paths only).
pub fn normalize_parts(parts: Vec<&str>, allow_above_root: bool) -> Vec<&str> {
    let mut out: Vec<&str> = Vec::new();

    for part in parts {
        match part {
            "." => {}
            ".." => {
                if out.last().is_some_and(|p| *p != "..") {
                    out.pop();
                } else if allow_above_root {
                    out.push("..");
                }
            }
            _ => out.push(part),
        }
    }

    out
}

/// Normalize a path: collapse dot components and duplicate slashes, keep a
/// trailing slash, never escape the root for absolute paths.
pub fn normalize(path: &str) -> String {
    let is_absolute = path.starts_with('/');
    let trailing_slash = path.ends_with('/');

    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    let mut normalized = normalize_parts(parts, !is_absolute).join("/");

    if normalized.is_empty() && !is_absolute {
        normalized = ".".to_string();
    }
    if !normalized.is_empty() && trailing_slash {
        normalized.push('/');
    }

    format!("{}{}", if is_absolute { "/" } else { "" }, normalized)
}

/// Resolve `to` against `from`, right to left, stopping at the first
/// absolute component. An empty component resolves to the empty string,
/// which lookups treat as no entry.
pub fn resolve(from: &str, to: &str) -> String {
    let mut resolved = String::new();
    let mut absolute = false;

    for path in [to, from] {
        if absolute {
            break;
        }
        if path.is_empty() {
            return String::new();
        }
        resolved = format!("{}/{}", path, resolved);
        absolute = path.starts_with('/');
    }

    let parts: Vec<&str> = resolved.split('/').filter(|p| !p.is_empty()).collect();
    let joined = normalize_parts(parts, !absolute).join("/");
    let out = format!("{}{}", if absolute { "/" } else { "" }, joined);

    if out.is_empty() {
        ".".to_string()
    } else {
        out
    }
}

pub fn join2(left: &str, right: &str) -> String {
    normalize(&format!("{}/{}", left, right))
}

/// Directory part of a path. `/a/b` -> `/a`, `a` -> `.`, `/a` -> `/`.
pub fn dirname(path: &str) -> String {
    let trimmed = if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    };

    match trimmed.rfind('/') {
        None => ".".to_string(),
        Some(0) => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
    }
}

/// Final component of a path. The root's basename is `/`.
pub fn basename(path: &str) -> String {
    if path == "/" {
        return "/".to_string();
    }

    let normalized = normalize(path);
    let trimmed = normalized.trim_end_matches('/');

    match trimmed.rfind('/') {
        None => trimmed.to_string(),
        Some(idx) => trimmed[idx + 1..].to_string(),
    }
}

/// Relative walk from one absolute path to another, as `..`-prefixed
/// components. Both inputs must already be resolved absolute paths.
pub fn relative(from: &str, to: &str) -> String {
    let from_parts: Vec<&str> = from.split('/').filter(|p| !p.is_empty()).collect();
    let to_parts: Vec<&str> = to.split('/').filter(|p| !p.is_empty()).collect();

    let limit = from_parts.len().min(to_parts.len());
    let mut same = limit;
    for i in 0..limit {
        if from_parts[i] != to_parts[i] {
            same = i;
            break;
        }
    }

    let mut out: Vec<&str> = vec![".."; from_parts.len() - same];
    out.extend(&to_parts[same..]);
    out.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/a/b/../c"), "/a/c");
        assert_eq!(normalize("/a//b/./c/"), "/a/b/c/");
        assert_eq!(normalize("/../.."), "/");
        assert_eq!(normalize("a/../../b"), "../b");
        assert_eq!(normalize(""), ".");
        assert_eq!(normalize("/"), "/");
    }

    #[test]
    fn test_resolve() {
        assert_eq!(resolve("/home/user", "docs"), "/home/user/docs");
        assert_eq!(resolve("/home/user", "/etc/passwd"), "/etc/passwd");
        assert_eq!(resolve("/home/user", "../shared"), "/home/shared");
        assert_eq!(resolve("/", ".."), "/");
        assert_eq!(resolve("/home", ""), "");
    }

    #[test]
    fn test_dirname_basename() {
        assert_eq!(dirname("/a/b/c"), "/a/b");
        assert_eq!(dirname("/a"), "/");
        assert_eq!(dirname("a"), ".");
        assert_eq!(dirname("/a/b/"), "/a");
        assert_eq!(basename("/a/b/c"), "c");
        assert_eq!(basename("/a/b/"), "b");
        assert_eq!(basename("/"), "/");
    }

    #[test]
    fn test_join2() {
        assert_eq!(join2("/dev", "tty"), "/dev/tty");
        assert_eq!(join2("/a/", "/b"), "/a/b");
    }

    #[test]
    fn test_relative() {
        assert_eq!(relative("/data/a", "/data/b"), "../b");
        assert_eq!(relative("/data", "/data/sub/x"), "sub/x");
        assert_eq!(relative("/a/b", "/a"), "..");
        assert_eq!(relative("/same", "/same"), "");
    }
}
