//! Absolute hierarchical scene paths.
//!
//! `ScenePath` is the value type every cache map is keyed by. It is always
//! absolute (`/World/Set_1/Prop`), immutable, and cheap to clone.
//!
//! # Invariants
//! - Paths start with `/`, contain no empty components, and never carry a
//!   trailing separator (the absolute root `/` is the one-byte exception).
//! - `Ord` compares component-wise, not byte-wise over the rendered string.
//!   Under this ordering, for any path `p` the set of paths with prefix `p`
//!   is a single contiguous ascending range starting at `p` itself. Prefix
//!   range scans over a `BTreeMap<ScenePath, _>` depend on this; byte-wise
//!   ordering would interleave siblings like `/World/A!` between `/World/A`
//!   and its children.
//! - `Eq` and `Hash` agree with the canonical rendered string, and equality
//!   agrees with component-wise comparison.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Error from parsing a string into a [`ScenePath`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScenePathError {
    /// The input string was empty.
    Empty,
    /// The input did not start with `/`.
    NotAbsolute,
    /// The input contained an empty component (`//`, or a trailing `/`).
    EmptyComponent,
}

impl fmt::Display for ScenePathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenePathError::Empty => write!(f, "scene path is empty"),
            ScenePathError::NotAbsolute => write!(f, "scene path is not absolute"),
            ScenePathError::EmptyComponent => {
                write!(f, "scene path contains an empty component")
            }
        }
    }
}

impl std::error::Error for ScenePathError {}

/// An absolute hierarchical path identifying a prim or prim index.
///
/// Cloning shares the underlying storage, so paths can be inserted into
/// several maps without re-allocating.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ScenePath(Arc<str>);

impl ScenePath {
    /// The absolute root path `/`.
    pub fn absolute_root() -> Self {
        ScenePath(Arc::from("/"))
    }

    /// Builds a path from a string.
    ///
    /// # Panics
    ///
    /// Panics on empty, relative, or malformed input. Use the [`FromStr`]
    /// impl when parsing untrusted strings.
    pub fn new(path: impl AsRef<str>) -> Self {
        let path = path.as_ref();
        match path.parse() {
            Ok(parsed) => parsed,
            Err(err) => panic!("invalid scene path {path:?}: {err}"),
        }
    }

    /// Renders the path as its canonical string.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the absolute root `/`.
    #[inline]
    pub fn is_absolute_root(&self) -> bool {
        &*self.0 == "/"
    }

    /// True for paths with exactly one component, e.g. `/World`.
    #[inline]
    pub fn is_root_prim_path(&self) -> bool {
        !self.is_absolute_root() && !self.0[1..].contains('/')
    }

    /// The final component name; `""` for the absolute root.
    #[inline]
    pub fn name(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => "",
        }
    }

    /// Iterates the path's components from the root down.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        // Only the absolute root produces an empty remainder; real
        // components are never empty by construction.
        self.0[1..].split('/').filter(|c| !c.is_empty())
    }

    /// The parent path, or `None` for the absolute root.
    pub fn parent(&self) -> Option<ScenePath> {
        if self.is_absolute_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(ScenePath::absolute_root()),
            Some(idx) => Some(ScenePath(Arc::from(&self.0[..idx]))),
            None => None,
        }
    }

    /// Component-wise prefix test. Every path has the absolute root as a
    /// prefix, and every path is a prefix of itself.
    pub fn has_prefix(&self, prefix: &ScenePath) -> bool {
        if prefix.is_absolute_root() {
            return true;
        }
        let this = &*self.0;
        let pre = &*prefix.0;
        this == pre
            || (this.len() > pre.len()
                && this.starts_with(pre)
                && this.as_bytes()[pre.len()] == b'/')
    }

    /// Rewrites the leading `old` components to `new`. Returns the path
    /// unchanged when `old` is not a prefix of `self`.
    pub fn replace_prefix(&self, old: &ScenePath, new: &ScenePath) -> ScenePath {
        if !self.has_prefix(old) {
            return self.clone();
        }
        if old.is_absolute_root() {
            if self.is_absolute_root() || new.is_absolute_root() {
                return if self.is_absolute_root() {
                    new.clone()
                } else {
                    self.clone()
                };
            }
            return ScenePath(Arc::from(format!("{}{}", new.0, self.0)));
        }
        let suffix = &self.0[old.0.len()..];
        if suffix.is_empty() {
            return new.clone();
        }
        if new.is_absolute_root() {
            // `suffix` begins with the separator, so it is already absolute.
            return ScenePath(Arc::from(suffix));
        }
        ScenePath(Arc::from(format!("{}{}", new.0, suffix)))
    }

    /// Appends a child component.
    ///
    /// # Panics
    ///
    /// Panics if `name` is empty or contains a separator.
    pub fn append_child(&self, name: &str) -> ScenePath {
        assert!(
            !name.is_empty() && !name.contains('/'),
            "invalid prim name {name:?}"
        );
        if self.is_absolute_root() {
            ScenePath(Arc::from(format!("/{name}")))
        } else {
            ScenePath(Arc::from(format!("{}/{name}", self.0)))
        }
    }
}

impl FromStr for ScenePath {
    type Err = ScenePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ScenePathError::Empty);
        }
        if !s.starts_with('/') {
            return Err(ScenePathError::NotAbsolute);
        }
        if s == "/" {
            return Ok(ScenePath::absolute_root());
        }
        if s[1..].split('/').any(|c| c.is_empty()) {
            return Err(ScenePathError::EmptyComponent);
        }
        Ok(ScenePath(Arc::from(s)))
    }
}

impl Ord for ScenePath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components().cmp(other.components())
    }
}

impl PartialOrd for ScenePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ScenePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ScenePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScenePath({})", self.0)
    }
}
