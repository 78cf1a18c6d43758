//! Virtual path utilities.
//!
//! All module paths are absolute POSIX strings inside the sandbox's virtual
//! file system (`/src/index.js`, `/node_modules/react/index.js`), so these
//! helpers operate on strings rather than `std::path`. Requests may carry a
//! loader-query prefix (`style-loader!css-loader!./app.css`) which
//! [`split_query`] separates from the path proper.

/// Sentinel path of the empty shim module.
pub const EMPTY_SHIM_PATH: &str = "//empty.js";

/// Split a loader-query prefix from a request.
///
/// `"a-loader!b-loader!./x.css"` becomes `("a-loader!b-loader", "./x.css")`.
/// A request without `!` has an empty query.
#[must_use]
pub fn split_query(request: &str) -> (&str, &str) {
    match request.rfind('!') {
        Some(idx) => (&request[..idx], &request[idx + 1..]),
        None => ("", request),
    }
}

/// Whether a path is absolute in the virtual FS.
#[must_use]
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Normalize a virtual path: collapse `.` and `..` segments and duplicate
/// separators. Absolute inputs stay absolute; `..` never escapes the root.
///
/// The empty-shim sentinel `//empty.js` is preserved verbatim; its double
/// slash is meaningful.
#[must_use]
pub fn normalize(path: &str) -> String {
    if path == EMPTY_SHIM_PATH {
        return path.to_string();
    }

    let absolute = is_absolute(path);
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if matches!(segments.last(), Some(&s) if s != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Join a base directory and a request, normalizing the result.
#[must_use]
pub fn join(base: &str, request: &str) -> String {
    if is_absolute(request) {
        normalize(request)
    } else {
        normalize(&format!("{base}/{request}"))
    }
}

/// Directory portion of a path (`/a/b/c.js` → `/a/b`). The root's dirname
/// is the root itself.
#[must_use]
pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => ".",
    }
}

/// File portion of a path (`/a/b/c.js` → `c.js`).
#[must_use]
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Extension including the dot (`/a/b.test.js` → `.js`), or `""` when the
/// basename has none.
#[must_use]
pub fn extension(path: &str) -> &str {
    let base = basename(path);
    match base.rfind('.') {
        Some(idx) if idx > 0 => &base[idx..],
        _ => "",
    }
}

/// Whether the path carries one of the given extensions.
#[must_use]
pub fn has_extension_of(path: &str, extensions: &[String]) -> bool {
    let ext = extension(path);
    !ext.is_empty() && extensions.iter().any(|e| e == ext)
}

/// The `node_modules` lookup directories for a starting directory, innermost
/// first, followed by any extra module directories (tsconfig `baseUrl`,
/// `NODE_PATH` roots).
#[must_use]
pub fn node_modules_paths(from_dir: &str, module_directories: &[String]) -> Vec<String> {
    let mut paths = Vec::new();
    let normalized = normalize(from_dir);

    let mut current = normalized.as_str();
    loop {
        if basename(current) != "node_modules" {
            paths.push(join(current, "node_modules"));
        }
        if current == "/" {
            break;
        }
        current = dirname(current);
    }

    for dir in module_directories {
        if dir != "node_modules" {
            let abs = if is_absolute(dir) {
                normalize(dir)
            } else {
                join("/", dir)
            };
            if !paths.contains(&abs) {
                paths.push(abs);
            }
        }
    }

    paths
}

/// Top-level package name of a bare request (`react/jsx-runtime` → `react`,
/// `@scope/pkg/sub` → `@scope/pkg`).
#[must_use]
pub fn package_name(request: &str) -> &str {
    let mut parts = request.splitn(3, '/');
    match (parts.next(), parts.next()) {
        (Some(scope), Some(name)) if scope.starts_with('@') => {
            &request[..scope.len() + 1 + name.len()]
        }
        (Some(name), _) => name,
        (None, _) => request,
    }
}

/// Package name a `/node_modules/...` path belongs to, if any.
#[must_use]
pub fn node_modules_package(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/node_modules/")?;
    let name = package_name(rest);
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_query() {
        assert_eq!(split_query("./a.js"), ("", "./a.js"));
        assert_eq!(split_query("raw!./a.css"), ("raw", "./a.css"));
        assert_eq!(
            split_query("style-loader!css-loader!./a.css"),
            ("style-loader!css-loader", "./a.css")
        );
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/a/./b/../c.js"), "/a/c.js");
        assert_eq!(normalize("/a//b.js"), "/a/b.js");
        assert_eq!(normalize("/../a.js"), "/a.js");
        assert_eq!(normalize("./a/b.js"), "a/b.js");
        assert_eq!(normalize("../x"), "../x");
    }

    #[test]
    fn test_normalize_preserves_empty_shim() {
        assert_eq!(normalize(EMPTY_SHIM_PATH), EMPTY_SHIM_PATH);
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/src", "./dep.js"), "/src/dep.js");
        assert_eq!(join("/src/nested", "../dep.js"), "/src/dep.js");
        assert_eq!(join("/src", "/abs.js"), "/abs.js");
    }

    #[test]
    fn test_dirname_basename() {
        assert_eq!(dirname("/a/b/c.js"), "/a/b");
        assert_eq!(dirname("/a.js"), "/");
        assert_eq!(basename("/a/b/c.js"), "c.js");
    }

    #[test]
    fn test_extension() {
        assert_eq!(extension("/a/b.test.js"), ".js");
        assert_eq!(extension("/a/b"), "");
        assert_eq!(extension("/a/.env"), "");
    }

    #[test]
    fn test_node_modules_paths() {
        let paths = node_modules_paths("/src/components", &[]);
        assert_eq!(
            paths,
            vec![
                "/src/components/node_modules".to_string(),
                "/src/node_modules".to_string(),
                "/node_modules".to_string(),
            ]
        );
    }

    #[test]
    fn test_node_modules_paths_skips_node_modules_dirs() {
        let paths = node_modules_paths("/node_modules/react/cjs", &[]);
        assert!(paths.contains(&"/node_modules/react/cjs/node_modules".to_string()));
        assert!(paths.contains(&"/node_modules/react/node_modules".to_string()));
        assert!(paths.contains(&"/node_modules".to_string()));
        assert!(!paths.contains(&"/node_modules/node_modules".to_string()));
    }

    #[test]
    fn test_package_name() {
        assert_eq!(package_name("react"), "react");
        assert_eq!(package_name("react/jsx-runtime"), "react");
        assert_eq!(package_name("@scope/pkg/sub"), "@scope/pkg");
    }

    #[test]
    fn test_node_modules_package() {
        assert_eq!(node_modules_package("/node_modules/react/index.js"), Some("react"));
        assert_eq!(
            node_modules_package("/node_modules/@scope/pkg/index.js"),
            Some("@scope/pkg")
        );
        assert_eq!(node_modules_package("/src/index.js"), None);
    }
}
