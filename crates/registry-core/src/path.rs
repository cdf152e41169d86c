//! Path validation, namespacing and cache keys.

use std::fmt;

use crate::StoreError;

/// Path separator.
pub const SEPARATOR: char = '/';

/// Root path.
pub const ROOT: &str = "/";

/// Validate an absolute node path.
///
/// # Errors
/// Returns `InvalidPath` if the path is empty, relative, has a trailing
/// separator (other than the root), an empty segment, or a `.`/`..` segment.
pub fn validate(path: &str) -> Result<(), StoreError> {
    if path.is_empty() {
        return Err(StoreError::InvalidPath("path must not be empty".to_string()));
    }
    if !path.starts_with(SEPARATOR) {
        return Err(StoreError::InvalidPath(format!("path must start with '/': {path}")));
    }
    if path == ROOT {
        return Ok(());
    }
    if path.ends_with(SEPARATOR) {
        return Err(StoreError::InvalidPath(format!("path must not end with '/': {path}")));
    }
    for segment in path[1..].split(SEPARATOR) {
        match segment {
            "" => return Err(StoreError::InvalidPath(format!("empty segment in {path}"))),
            "." | ".." => {
                return Err(StoreError::InvalidPath(format!("relative segment in {path}")));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Parent of an absolute path. The root has no parent.
#[must_use]
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind(SEPARATOR) {
        Some(0) => Some(ROOT),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of an absolute path.
#[must_use]
pub fn node_name(path: &str) -> &str {
    path.rsplit(SEPARATOR).next().unwrap_or(path)
}

/// Join a parent path and a child name.
#[must_use]
pub fn join(parent: &str, child: &str) -> String {
    if parent == ROOT {
        format!("{ROOT}{child}")
    } else {
        format!("{parent}{SEPARATOR}{child}")
    }
}

/// Whether `path` is `root` or one of its descendants.
///
/// `/ab` is not within `/a`.
#[must_use]
pub fn is_within(root: &str, path: &str) -> bool {
    if root == ROOT {
        return path.starts_with(SEPARATOR);
    }
    path == root
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with(SEPARATOR))
}

/// Namespace prefix applied transparently to every caller path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Namespace {
    prefix: Option<String>,
}

impl Namespace {
    /// Create a namespace. Leading and trailing separators are optional;
    /// an empty name means no prefix.
    ///
    /// # Errors
    /// Returns `InvalidPath` if the resulting prefix is not a valid path.
    pub fn new(name: &str) -> Result<Self, StoreError> {
        let trimmed = name.trim_matches(SEPARATOR);
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        let prefix = format!("{SEPARATOR}{trimmed}");
        validate(&prefix)?;
        Ok(Self {
            prefix: Some(prefix),
        })
    }

    /// The absolute prefix, if any.
    #[must_use]
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Convert a caller path into a store path.
    ///
    /// # Errors
    /// Returns `InvalidPath` if `path` is not a valid absolute path.
    pub fn fix(&self, path: &str) -> Result<String, StoreError> {
        validate(path)?;
        Ok(match &self.prefix {
            None => path.to_string(),
            Some(prefix) if path == ROOT => prefix.clone(),
            Some(prefix) => format!("{prefix}{path}"),
        })
    }

    /// Convert a store path back into caller coordinates.
    #[must_use]
    pub fn unfix(&self, path: &str) -> String {
        let Some(prefix) = &self.prefix else {
            return path.to_string();
        };
        match path.strip_prefix(prefix.as_str()) {
            Some("") => ROOT.to_string(),
            Some(rest) if rest.starts_with(SEPARATOR) => rest.to_string(),
            _ => path.to_string(),
        }
    }
}

/// Key for the watch cache registry.
///
/// Paths are stored with a trailing separator so `/a` and `/ab` never
/// collide when keys are compared by prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    #[must_use]
    pub fn new(path: &str) -> Self {
        if path.ends_with(SEPARATOR) {
            Self(path.to_string())
        } else {
            Self(format!("{path}{SEPARATOR}"))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
