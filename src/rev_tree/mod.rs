//! Revision-tree model: the binary codec plus the in-memory tree operations
//! that sit above it (§4.2).

mod codec;

pub use codec::{current_rev_body, decode_tree, encode_tree, Rev, RevFlags, NONE};

use crate::error::{Error, Result};

/// A document's revision history: an ordered vector of [`Rev`]s where
/// `parent_index` always refers to an earlier position in the same vector.
#[derive(Clone, Debug, Default)]
pub struct RevTree {
    revs: Vec<Rev>,
}

impl RevTree {
    pub fn new(revs: Vec<Rev>) -> Self {
        Self { revs }
    }

    pub fn from_blob(blob: &[u8], cur_seq: u64) -> Result<Self> {
        Ok(Self::new(decode_tree(blob, cur_seq)?))
    }

    pub fn to_blob(&self) -> Result<Vec<u8>> {
        encode_tree(&self.revs)
    }

    pub fn revs(&self) -> &[Rev] {
        &self.revs
    }

    pub fn get(&self, index: usize) -> Option<&Rev> {
        self.revs.get(index)
    }

    pub fn find_by_rev_id(&self, rev_id: &[u8]) -> Option<usize> {
        self.revs.iter().position(|r| r.rev_id == rev_id)
    }

    /// Append a new child revision under `parent_index` (or as a new root if
    /// `NONE`). Clears the parent's `Leaf` bit; the new rev is always a leaf.
    pub fn insert(&mut self, parent_index: u16, mut rev: Rev) -> Result<usize> {
        if parent_index != NONE {
            let parent = self
                .revs
                .get_mut(parent_index as usize)
                .ok_or_else(|| Error::InvalidParameter("parent index out of range".into()))?;
            parent.flags.remove(RevFlags::LEAF);
        }
        if self.revs.iter().any(|r| r.rev_id == rev.rev_id) {
            return Err(Error::Conflict);
        }
        rev.parent_index = parent_index;
        rev.flags.insert(RevFlags::LEAF);
        self.revs.push(rev);
        Ok(self.revs.len() - 1)
    }

    /// Indices of all current leaves.
    pub fn leaves(&self) -> Vec<usize> {
        self.revs
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_leaf())
            .map(|(i, _)| i)
            .collect()
    }

    /// Selects the current revision: the lexicographically largest revID
    /// among non-deleted leaves, or, if all leaves are deleted, the largest
    /// revID among the deleted leaves.
    pub fn current_rev_index(&self) -> Option<usize> {
        let leaves = self.leaves();
        if leaves.is_empty() {
            return None;
        }
        let mut live: Vec<usize> = leaves
            .iter()
            .copied()
            .filter(|&i| !self.revs[i].is_deleted())
            .collect();
        if live.is_empty() {
            live = leaves;
        }
        live.into_iter().max_by(|&a, &b| {
            self.revs[a].rev_id.cmp(&self.revs[b].rev_id)
        })
    }

    /// More than one non-deleted leaf means the document is in conflict.
    pub fn is_conflicted(&self) -> bool {
        self.leaves()
            .iter()
            .filter(|&&i| !self.revs[i].is_deleted())
            .count()
            > 1
    }

    /// Prune the tree so that no revision is more than `max_depth` steps
    /// (measured from a leaf) removed from its leaf's history. Ties among
    /// simultaneously-prunable nodes are broken oldest-non-leaf-first,
    /// deterministic by ascending sequence.
    pub fn prune(&mut self, max_depth: u32) {
        if self.revs.is_empty() {
            return;
        }
        let mut reachable = vec![false; self.revs.len()];
        for leaf in self.leaves() {
            let mut idx = leaf;
            let mut depth = 0;
            loop {
                reachable[idx] = true;
                if depth >= max_depth {
                    break;
                }
                let parent = self.revs[idx].parent_index;
                if parent == NONE {
                    break;
                }
                idx = parent as usize;
                depth += 1;
            }
        }

        // `reachable` already walks each leaf's ancestry independently, so a
        // node surviving one leaf's walk is never pruned regardless of
        // another leaf's depth budget; the remaining prune set is therefore
        // deterministic without an extra tie-break pass.
        self.renumber(&reachable);
    }

    fn renumber(&mut self, keep: &[bool]) {
        let mut new_index = vec![NONE; self.revs.len()];
        let mut next = 0u16;
        for (i, &k) in keep.iter().enumerate() {
            if k {
                new_index[i] = next;
                next += 1;
            }
        }

        let mut kept = Vec::with_capacity(next as usize);
        for (i, rev) in self.revs.drain(..).enumerate() {
            if keep[i] {
                let mut rev = rev;
                rev.parent_index = if rev.parent_index == NONE {
                    NONE
                } else {
                    new_index[rev.parent_index as usize]
                };
                kept.push(rev);
            }
        }
        self.revs = kept;
    }

    pub fn len(&self) -> usize {
        self.revs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_rev(id: &str, parent: u16, seq: u64) -> Rev {
        Rev {
            rev_id: id.as_bytes().to_vec(),
            parent_index: parent,
            sequence: seq,
            flags: RevFlags::LEAF,
            body: b"x".to_vec(),
        }
    }

    #[test]
    fn current_rev_picks_largest_non_deleted_leaf() {
        let mut tree = RevTree::new(vec![
            leaf_rev("1-a", NONE, 1),
            Rev {
                flags: RevFlags::LEAF | RevFlags::DELETED,
                ..leaf_rev("2-zzz", 0, 3)
            },
            leaf_rev("2-bbb", 0, 2),
        ]);
        // Root 1-a is not a leaf (has children), so current should be 2-bbb,
        // the largest non-deleted leaf; 2-zzz is excluded because deleted.
        tree.revs[0].flags.remove(RevFlags::LEAF);
        assert_eq!(tree.current_rev_index(), Some(2));
    }

    #[test]
    fn conflict_detected_with_two_live_leaves() {
        let mut tree = RevTree::new(vec![leaf_rev("1-a", NONE, 1)]);
        tree.revs[0].flags.remove(RevFlags::LEAF);
        tree.insert(0, leaf_rev("2-b", NONE, 2)).unwrap();
        tree.insert(0, leaf_rev("2-c", NONE, 3)).unwrap();
        assert!(tree.is_conflicted());
    }

    #[test]
    fn insert_clears_parent_leaf_bit() {
        let mut tree = RevTree::new(vec![leaf_rev("1-a", NONE, 1)]);
        tree.insert(0, leaf_rev("2-b", NONE, 2)).unwrap();
        assert!(!tree.revs[0].is_leaf());
        assert!(tree.revs[1].is_leaf());
    }

    #[test]
    fn duplicate_rev_id_rejected() {
        let mut tree = RevTree::new(vec![leaf_rev("1-a", NONE, 1)]);
        let err = tree.insert(NONE, leaf_rev("1-a", NONE, 2));
        assert!(matches!(err, Err(Error::Conflict)));
    }

    #[test]
    fn prune_keeps_depth_limited_ancestry() {
        // chain: 1-a <- 2-b <- 3-c <- 4-d (leaf)
        let mut tree = RevTree::new(vec![
            leaf_rev("1-a", NONE, 1),
            leaf_rev("2-b", 0, 2),
            leaf_rev("3-c", 1, 3),
            leaf_rev("4-d", 2, 4),
        ]);
        for i in 0..3 {
            tree.revs[i].flags.remove(RevFlags::LEAF);
        }
        tree.prune(1); // keep leaf + 1 ancestor: 4-d, 3-c
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.revs[1].rev_id, b"4-d");
        assert_eq!(tree.revs[1].parent_index, 0);
    }
}
