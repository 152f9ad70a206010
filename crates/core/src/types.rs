//! Domain types: hierarchical rights and access requests.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Rights
// ---------------------------------------------------------------------------

/// One path element of a [`Right`].
///
/// Untagged on the wire so scripts can write `["db", 3]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Segment {
    Index(u64),
    Name(Arc<str>),
}

impl From<&str> for Segment {
    fn from(s: &str) -> Self {
        Segment::Name(Arc::from(s))
    }
}

impl From<String> for Segment {
    fn from(s: String) -> Self {
        Segment::Name(Arc::from(s))
    }
}

impl From<u64> for Segment {
    fn from(i: u64) -> Self {
        Segment::Index(i)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Index(i) => write!(f, "{i}"),
            Segment::Name(s) => f.write_str(s),
        }
    }
}

/// A hierarchical resource scope.
///
/// Holding a right implicitly holds every right below it. Two rights
/// conflict when one is a prefix of the other; siblings never do.
/// The empty path is the universal right.
///
/// `SmallVec<[Segment; 4]>` keeps typical rights off the heap.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Right {
    segments: SmallVec<[Segment; 4]>,
}

impl Right {
    pub fn new<S: Into<Segment>>(segments: impl IntoIterator<Item = S>) -> Self {
        segments.into_iter().map(Into::into).collect()
    }

    /// The root right, conflicting with every other right.
    pub fn universal() -> Self {
        Self::default()
    }

    pub fn is_universal(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// `None` for the universal right.
    pub fn parent(&self) -> Option<Right> {
        if self.is_universal() {
            return None;
        }
        let mut segments = self.segments.clone();
        segments.pop();
        Some(Right { segments })
    }

    pub fn child(&self, segment: impl Into<Segment>) -> Right {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Right { segments }
    }

    /// True if `self` is a prefix of `other` (equality included).
    pub fn is_ancestor_of(&self, other: &Right) -> bool {
        other.segments.starts_with(&self.segments)
    }

    pub fn conflicts_with(&self, other: &Right) -> bool {
        self.is_ancestor_of(other) || other.is_ancestor_of(self)
    }
}

impl<S: Into<Segment>> FromIterator<S> for Right {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Right {
            segments: iter.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for Right {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_universal() {
            return f.write_str("*");
        }
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{seg}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// An immutable request for a set of read and write rights.
///
/// The id is carried onto the resulting token; it need not be unique.
#[derive(Debug, Clone)]
pub struct AccessRequest<I> {
    id: I,
    read_rights: Vec<Right>,
    write_rights: Vec<Right>,
}

impl<I> AccessRequest<I> {
    pub fn new(
        id: I,
        read_rights: impl IntoIterator<Item = Right>,
        write_rights: impl IntoIterator<Item = Right>,
    ) -> Self {
        Self {
            id,
            read_rights: read_rights.into_iter().collect(),
            write_rights: write_rights.into_iter().collect(),
        }
    }

    pub fn read(id: I, right: Right) -> Self {
        Self::new(id, [right], [])
    }

    pub fn write(id: I, right: Right) -> Self {
        Self::new(id, [], [right])
    }

    pub fn id(&self) -> &I {
        &self.id
    }

    pub fn read_rights(&self) -> &[Right] {
        &self.read_rights
    }

    pub fn write_rights(&self) -> &[Right] {
        &self.write_rights
    }

    pub fn is_empty(&self) -> bool {
        self.read_rights.is_empty() && self.write_rights.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Manager state
// ---------------------------------------------------------------------------

/// Coarse availability of a single right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessState {
    /// Neither read nor write is held anywhere on the right's path.
    Available,
    /// Only read access is held; further reads are allowed.
    ReadOnly,
    /// Write access is held.
    Unavailable,
}

/// Access mode of a right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    Read,
    Write,
}

/// Rights currently registered in a manager, minimal per tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RightsSnapshot {
    pub read: Vec<Right>,
    pub write: Vec<Right>,
}

impl RightsSnapshot {
    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_relation_defines_conflict() {
        let a = Right::new(["a"]);
        let ax = Right::new(["a", "x"]);
        let ay = Right::new(["a", "y"]);
        let axz = Right::new(["a", "x", "z"]);

        assert!(a.conflicts_with(&ax));
        assert!(ax.conflicts_with(&axz));
        assert!(axz.conflicts_with(&ax));
        assert!(ax.conflicts_with(&ax));
        assert!(!ax.conflicts_with(&ay));
        assert!(!axz.conflicts_with(&ay));
    }

    #[test]
    fn universal_conflicts_with_everything() {
        let u = Right::universal();
        assert!(u.is_universal());
        assert!(u.conflicts_with(&Right::new(["x", "y"])));
        assert_eq!(u.parent(), None);
        assert_eq!(u.to_string(), "*");
    }

    #[test]
    fn parent_and_child_navigate_the_path() {
        let r = Right::new(["db"]).child("table1").child(7u64);
        assert_eq!(r.to_string(), "db/table1/7");
        assert_eq!(r.parent(), Some(Right::new(["db", "table1"])));
        assert_eq!(r.depth(), 3);
    }

    #[test]
    fn segments_parse_untagged() {
        let r: Right = serde_json::from_str(r#"["db", 3]"#).unwrap();
        assert_eq!(r.segments(), &[Segment::from("db"), Segment::from(3u64)]);
        assert_eq!(serde_json::to_string(&r).unwrap(), r#"["db",3]"#);
    }

    #[test]
    fn request_keeps_its_rights() {
        let req = AccessRequest::new(1, [Right::new(["r"])], [Right::new(["w"])]);
        assert_eq!(*req.id(), 1);
        assert_eq!(req.read_rights(), &[Right::new(["r"])]);
        assert_eq!(req.write_rights(), &[Right::new(["w"])]);
        assert!(!req.is_empty());
        assert!(AccessRequest::new(2, [], []).is_empty());
    }
}
