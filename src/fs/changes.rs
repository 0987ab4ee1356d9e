//! The tagged tree produced by the discovery phase of a sync and
//! consumed by its apply phase.
//!
//! The original records changes as a map from child name to
//! `(ChangeType, Option<map>)`, where the nested map is only present for
//! directories. Rust can say that directly with an enum instead of
//! smuggling "is this a directory" through an `Option`:
//! [`Entry::Leaf`] carries just a change, [`Entry::Dir`] carries a change
//! plus its children. A `BTreeMap` keeps iteration order deterministic,
//! which `dict` in insertion order does not guarantee across runs.

use std::collections::BTreeMap;
use std::ffi::OsString;

/// What happened (or needs to happen) to one filesystem node during a
/// sync, relative to its counterpart in the other tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    /// Node is unchanged and does not need any action.
    NoChange,
    /// Node no longer exists on the source side and should be removed
    /// from the target.
    RemoveNode,
    /// Node's type differs (or the target is missing); the existing
    /// target node (if any) must be removed before copying.
    CreateNode,
    /// Node exists on both sides with the same type but must be
    /// refreshed (content copy for files, recurse for directories).
    UpdateNode,
    /// Node's content matches but its mtime/permissions do not.
    UpdateStat,
}

/// A tagged tree of per-node changes, rooted at whatever directory the
/// discovery phase was pointed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// A file, symlink, or special node and the change recorded for it.
    Leaf(ChangeType),
    /// A directory: the change recorded for the directory node itself,
    /// plus a child entry per name found on either side of the sync.
    Dir(ChangeType, BTreeMap<OsString, Entry>),
}

impl Entry {
    /// The change recorded for this node itself (not its children).
    #[must_use]
    pub fn change(&self) -> ChangeType {
        match self {
            Self::Leaf(c) | Self::Dir(c, _) => *c,
        }
    }

    /// Children of this entry, if it is a directory.
    #[must_use]
    pub fn children(&self) -> Option<&BTreeMap<OsString, Entry>> {
        match self {
            Self::Dir(_, children) => Some(children),
            Self::Leaf(_) => None,
        }
    }

    /// Total number of nodes in the tree rooted at `self`, including
    /// `self`.
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::Leaf(_) => 1,
            Self::Dir(_, children) => {
                1 + children.values().map(Entry::count).sum::<usize>()
            }
        }
    }
}

/// The discovery-phase result for one sync root: a name-to-entry map at
/// the top level (there is no single root name to hang an `Entry` off
/// of, since `include_paths` can list several independent roots).
pub type FileChanges = BTreeMap<OsString, Entry>;

/// Total number of nodes across every entry in `changes`, used to size
/// the apply-phase progress bar.
#[must_use]
pub fn count_nodes(changes: &FileChanges) -> usize {
    changes.values().map(Entry::count).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_includes_nested_children() {
        let mut children = BTreeMap::new();
        children.insert(OsString::from("a"), Entry::Leaf(ChangeType::NoChange));
        children.insert(OsString::from("b"), Entry::Leaf(ChangeType::UpdateNode));
        let dir = Entry::Dir(ChangeType::NoChange, children);
        assert_eq!(dir.count(), 3);
    }

    #[test]
    fn count_nodes_sums_across_roots() {
        let mut changes = FileChanges::new();
        changes.insert(OsString::from("f1"), Entry::Leaf(ChangeType::CreateNode));
        changes.insert(
            OsString::from("d1"),
            Entry::Dir(ChangeType::NoChange, BTreeMap::new()),
        );
        assert_eq!(count_nodes(&changes), 2);
    }
}
