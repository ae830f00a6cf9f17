//! Addressing into hierarchical tables.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One step down a hierarchical table: pick a row, then a column of that row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathStep {
    pub row: u32,
    pub column: u32,
}

impl PathStep {
    #[must_use]
    pub const fn new(row: u32, column: u32) -> Self {
        Self { row, column }
    }
}

/// Path from the (implicit) root of a model to a cell or subtree.
///
/// The empty path addresses the root itself. Paths are positional, not
/// stable: structural changes above a path shift its meaning, which is why
/// the sync protocol ships index ranges rather than identities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelPath(Vec<PathStep>);

impl ModelPath {
    /// The root path.
    #[must_use]
    pub const fn root() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Extend the path by one step.
    #[must_use]
    pub fn child(&self, row: u32, column: u32) -> Self {
        let mut steps = self.0.clone();
        steps.push(PathStep::new(row, column));
        Self(steps)
    }

    /// Path without its last step; `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    /// Last step; `None` for the root.
    #[must_use]
    pub fn last(&self) -> Option<PathStep> {
        self.0.last().copied()
    }

    #[must_use]
    pub fn steps(&self) -> &[PathStep] {
        &self.0
    }

    /// Whether `self` lies inside the subtree rooted at `ancestor`.
    #[must_use]
    pub fn starts_with(&self, ancestor: &Self) -> bool {
        self.0.len() >= ancestor.0.len() && self.0[..ancestor.0.len()] == ancestor.0[..]
    }
}

impl FromIterator<PathStep> for ModelPath {
    fn from_iter<T: IntoIterator<Item = PathStep>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for ModelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for step in &self.0 {
            write!(f, "/{}:{}", step.row, step.column)?;
        }
        Ok(())
    }
}

/// Contiguous half-open row span `[start, start + len)` under one parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowRange {
    pub start: u32,
    pub len: u32,
}

impl RowRange {
    #[must_use]
    pub const fn new(start: u32, len: u32) -> Self {
        Self { start, len }
    }

    /// One past the last row, saturating at the index ceiling. Ranges come
    /// off the wire, so arithmetic on them must not trust the peer.
    #[must_use]
    pub const fn end(self) -> u32 {
        self.start.saturating_add(self.len)
    }

    #[must_use]
    pub const fn contains(self, row: u32) -> bool {
        row >= self.start && row < self.end()
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn overlaps(self, other: Self) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Smallest range covering both. Meaningful for coalescing overlapping
    /// or adjacent invalidations into one superseding range.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        let start = self.start.min(other.start);
        let end = self.end().max(other.end());
        Self::new(start, end - start)
    }

    #[must_use]
    pub fn rows(self) -> impl Iterator<Item = u32> {
        self.start..self.end()
    }
}

impl fmt::Display for RowRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_navigation() {
        let p = ModelPath::root().child(3, 0).child(1, 2);
        assert_eq!(p.len(), 2);
        assert_eq!(p.last(), Some(PathStep::new(1, 2)));
        assert_eq!(p.parent(), Some(ModelPath::root().child(3, 0)));
        assert_eq!(ModelPath::root().parent(), None);
        assert!(p.starts_with(&ModelPath::root().child(3, 0)));
        assert!(p.starts_with(&ModelPath::root()));
        assert!(!p.starts_with(&ModelPath::root().child(4, 0)));
    }

    #[test]
    fn path_display() {
        assert_eq!(ModelPath::root().to_string(), "/");
        assert_eq!(ModelPath::root().child(3, 0).to_string(), "/3:0");
    }

    #[test]
    fn range_extremes_saturate() {
        let hostile = RowRange::new(u32::MAX, u32::MAX);
        assert_eq!(hostile.end(), u32::MAX);
        assert!(!hostile.contains(u32::MAX));
        assert_eq!(
            hostile.union(RowRange::new(0, 1)),
            RowRange::new(0, u32::MAX)
        );
    }

    #[test]
    fn range_overlap_and_union() {
        let a = RowRange::new(0, 5);
        let b = RowRange::new(3, 4);
        let c = RowRange::new(8, 2);
        assert!(a.overlaps(b));
        assert!(!a.overlaps(c));
        assert_eq!(a.union(b), RowRange::new(0, 7));
        assert_eq!(a.union(c), RowRange::new(0, 10));
        assert!(RowRange::new(2, 0).is_empty());
    }
}
