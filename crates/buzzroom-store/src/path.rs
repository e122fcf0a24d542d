//! Store paths.
//!
//! A [`StorePath`] addresses one node in the store's JSON tree, written as
//! slash-separated segments (`rooms/ABCD/players/u1`). Paths never start or
//! end with a slash and never contain empty segments.

use std::fmt;

/// A normalized slash-separated path into the store tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorePath {
    joined: String,
}

impl StorePath {
    /// Build a path from raw text, dropping empty segments.
    pub fn new(raw: &str) -> Self {
        let joined = raw
            .split('/')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        Self { joined }
    }

    /// The root path (the whole tree).
    pub fn root() -> Self {
        Self {
            joined: String::new(),
        }
    }

    /// Append one segment.
    pub fn child(&self, segment: &str) -> Self {
        let seg = segment.trim_matches('/');
        if self.joined.is_empty() {
            Self::new(seg)
        } else if seg.is_empty() {
            self.clone()
        } else {
            Self {
                joined: format!("{}/{}", self.joined, seg),
            }
        }
    }

    /// Iterate the path segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.joined.split('/').filter(|s| !s.is_empty())
    }

    pub fn is_root(&self) -> bool {
        self.joined.is_empty()
    }

    /// Whether `self` is `other` or an ancestor of it.
    pub fn contains(&self, other: &Self) -> bool {
        if self.is_root() {
            return true;
        }
        other.joined == self.joined
            || other
                .joined
                .strip_prefix(&self.joined)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Whether a mutation at `mutated` is visible to a subscriber of `self`.
    ///
    /// True when either path contains the other: a write below the
    /// subscription changes the subscribed value, and a write above it
    /// replaces the subtree the subscription lives in.
    pub fn overlaps(&self, mutated: &Self) -> bool {
        self.contains(mutated) || mutated.contains(self)
    }

    pub fn as_str(&self) -> &str {
        &self.joined
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("/")
        } else {
            f.write_str(&self.joined)
        }
    }
}

impl From<&str> for StorePath {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_slashes() {
        assert_eq!(StorePath::new("/rooms//ABCD/").as_str(), "rooms/ABCD");
        assert_eq!(StorePath::new("rooms/ABCD").as_str(), "rooms/ABCD");
    }

    #[test]
    fn child_appends() {
        let p = StorePath::new("rooms").child("ABCD").child("players/u1");
        assert_eq!(p.as_str(), "rooms/ABCD/players/u1");
    }

    #[test]
    fn containment() {
        let parent = StorePath::new("rooms/ABCD");
        let leaf = StorePath::new("rooms/ABCD/state/lock");
        let sibling = StorePath::new("rooms/ABCDE");

        assert!(parent.contains(&leaf));
        assert!(!leaf.contains(&parent));
        assert!(parent.contains(&parent));
        // "rooms/ABCDE" is not under "rooms/ABCD" despite the shared prefix.
        assert!(!parent.contains(&sibling));
        assert!(StorePath::root().contains(&leaf));
    }

    #[test]
    fn overlap_is_symmetric_on_lineage() {
        let parent = StorePath::new("rooms/ABCD");
        let leaf = StorePath::new("rooms/ABCD/meta");
        let other = StorePath::new("rooms/WXYZ");

        assert!(parent.overlaps(&leaf));
        assert!(leaf.overlaps(&parent));
        assert!(!leaf.overlaps(&other));
    }
}
