//! Hierarchical object addressing.
//!
//! A [`Urn`] is an ordered sequence of path components under a single root,
//! stored in normalized form (`/a/b/c`, root is `/`). Normalization:
//!
//! - An optional `strata:` scheme prefix is stripped
//! - Empty components (`//`, leading or trailing `/`) are dropped
//! - `.` components are dropped, `..` removes the previous component
//!
//! Two URNs are equal iff their normalized component sequences match.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Optional scheme accepted (and stripped) when parsing.
const SCHEME: &str = "strata:";

/// Hierarchical, immutable object identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Urn {
    path: String,
}

impl Urn {
    /// The root URN (`/`).
    pub fn root() -> Self {
        Self {
            path: "/".to_string(),
        }
    }

    /// Parse and normalize a string form.
    ///
    /// # Examples
    ///
    /// ```
    /// use strata_types::Urn;
    ///
    /// let urn = Urn::parse("strata:/C.1234//fs/./os/").unwrap();
    /// assert_eq!(urn.path(), "/C.1234/fs/os");
    /// assert!(Urn::parse("a\0b").is_err());
    /// ```
    pub fn parse(input: &str) -> Result<Self, TypeError> {
        let raw = input.strip_prefix(SCHEME).unwrap_or(input);
        if let Some(ch) = raw.chars().find(|c| c.is_control()) {
            return Err(TypeError::InvalidUrn {
                urn: input.to_string(),
                reason: format!("contains control character {ch:?}"),
            });
        }
        Ok(Self::from_components(normalize(raw)))
    }

    fn from_components<'a>(components: impl IntoIterator<Item = &'a str>) -> Self {
        let mut path = String::new();
        for component in components {
            path.push('/');
            path.push_str(component);
        }
        if path.is_empty() {
            path.push('/');
        }
        Self { path }
    }

    /// Normalized path form, always starting with `/`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns `true` for the root URN.
    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    /// Path components in order. The root has none.
    pub fn components(&self) -> impl Iterator<Item = &str> + '_ {
        self.path.split('/').filter(|c| !c.is_empty())
    }

    /// Number of components.
    pub fn depth(&self) -> usize {
        self.components().count()
    }

    /// Return a child URN. `component` may itself be a relative path.
    ///
    /// `self` is never mutated.
    pub fn add(&self, component: &str) -> Self {
        let joined = format!("{}/{}", self.path, component);
        Self::from_components(normalize(&joined))
    }

    /// Split into the first `n` components and the remaining relative path.
    pub fn split(&self, n: usize) -> Result<(Urn, String), TypeError> {
        let components: Vec<&str> = self.components().collect();
        if components.len() < n {
            return Err(TypeError::SplitOutOfRange {
                urn: self.path.clone(),
                depth: components.len(),
                at: n,
            });
        }
        let head = Self::from_components(components[..n].iter().copied());
        let rest = components[n..].join("/");
        Ok((head, rest))
    }

    /// The parent URN, or `None` for the root.
    pub fn parent(&self) -> Option<Urn> {
        if self.is_root() {
            return None;
        }
        let depth = self.depth();
        Some(Self::from_components(self.components().take(depth - 1)))
    }

    /// The last component, empty for the root.
    pub fn basename(&self) -> &str {
        self.components().last().unwrap_or("")
    }

    /// Returns `true` if `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &Urn) -> bool {
        if self == other {
            return false;
        }
        if self.is_root() {
            return true;
        }
        other
            .path
            .strip_prefix(self.path.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Strict ancestors from the immediate parent up to the root.
    pub fn ancestors(&self) -> Vec<Urn> {
        let mut out = Vec::new();
        let mut current = self.parent();
        while let Some(urn) = current {
            current = urn.parent();
            out.push(urn);
        }
        out
    }
}

fn normalize(raw: &str) -> Vec<&str> {
    let mut stack: Vec<&str> = Vec::new();
    for component in raw.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }
    stack
}

impl fmt::Debug for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Urn({})", self.path)
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl FromStr for Urn {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Urn {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for Urn {
    type Error = TypeError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Urn> for String {
    fn from(urn: Urn) -> Self {
        urn.path
    }
}
