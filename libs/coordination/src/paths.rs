//! Namespace path layout.
//!
//! The resolver is a pure translator from (environment, service) to the
//! concrete paths used on the coordination service. No path strings are built
//! anywhere else.

use crate::error::{CoordinationError, CoordinationResult};

/// Root of every presence namespace.
pub const PRESENCE_PREFIX: &str = "/coPresence";
/// Root of the global key/value namespace.
pub const GLOBAL_PREFIX: &str = "/dcell_global";
/// Member node name before the sequence suffix.
pub const NODE_PREFIX: &str = "node-";
/// Service used when none is given.
pub const DEFAULT_SERVICE: &str = "default";

/// Maps logical namespaces to concrete paths for one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathResolver {
    env: String,
}

impl PathResolver {
    /// Returns an error if `env` is not a single path segment.
    pub fn new(env: impl Into<String>) -> CoordinationResult<Self> {
        let env = env.into();
        validate_segment("env", &env)?;
        Ok(Self { env })
    }

    pub fn env(&self) -> &str {
        &self.env
    }

    /// `{PRESENCE_PREFIX}/{env}/{service}`
    pub fn presence_namespace(&self, service: &str) -> CoordinationResult<String> {
        validate_segment("service name", service)?;
        Ok(format!("{PRESENCE_PREFIX}/{}/{service}", self.env))
    }

    /// `{GLOBAL_PREFIX}/{env}`
    pub fn global_namespace(&self) -> String {
        format!("{GLOBAL_PREFIX}/{}", self.env)
    }

    /// Path handed to a sequential create of a member node.
    pub fn member_prefix(namespace: &str) -> String {
        join(namespace, NODE_PREFIX)
    }
}

/// `{base}/{child}`
pub fn join(base: &str, child: &str) -> String {
    format!("{}/{child}", base.trim_end_matches('/'))
}

/// Final segment of `path`.
pub fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Parent of `path`, `None` for the root or a bare segment.
pub fn parent(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

/// Every ancestor of `path` (excluding `/`) followed by `path` itself.
pub fn ancestors_inclusive(path: &str) -> Vec<&str> {
    path.match_indices('/')
        .map(|(idx, _)| idx)
        .skip(1)
        .map(|idx| &path[..idx])
        .chain(std::iter::once(path))
        .filter(|p| !p.is_empty() && *p != "/")
        .collect()
}

/// A name usable as exactly one path segment.
pub fn validate_segment(what: &str, name: &str) -> CoordinationResult<()> {
    if name.trim().is_empty() {
        return Err(CoordinationError::Config(format!("{what} is empty")));
    }
    if name.contains('/') || name == "." || name == ".." {
        return Err(CoordinationError::Config(format!(
            "{what} '{name}' is not a single path segment"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_namespace() {
        let resolver = PathResolver::new("production").unwrap();
        assert_eq!(
            resolver.presence_namespace("dcell_presence").unwrap(),
            "/coPresence/production/dcell_presence"
        );
        assert_eq!(
            PathResolver::member_prefix("/coPresence/production/dcell_presence"),
            "/coPresence/production/dcell_presence/node-"
        );
    }

    #[test]
    fn test_global_namespace() {
        let resolver = PathResolver::new("staging").unwrap();
        assert_eq!(resolver.global_namespace(), "/dcell_global/staging");
        assert_eq!(resolver.env(), "staging");
    }

    #[test]
    fn test_invalid_segments() {
        assert!(PathResolver::new("").is_err());
        assert!(PathResolver::new("a/b").is_err());
        let resolver = PathResolver::new("production").unwrap();
        assert!(resolver.presence_namespace("x/y").is_err());
        assert!(resolver.presence_namespace("..").is_err());
        assert!(matches!(
            validate_segment("key", " "),
            Err(CoordinationError::Config(_))
        ));
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(join("/a/b", "c"), "/a/b/c");
        assert_eq!(join("/a/b/", "c"), "/a/b/c");
        assert_eq!(last_segment("/a/b/node-0000000001"), "node-0000000001");
        assert_eq!(last_segment("plain"), "plain");
        assert_eq!(parent("/a/b/c"), Some("/a/b"));
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(ancestors_inclusive("/a/b/c"), vec!["/a", "/a/b", "/a/b/c"]);
        assert_eq!(ancestors_inclusive("/a"), vec!["/a"]);
    }
}
