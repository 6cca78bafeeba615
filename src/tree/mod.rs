// Copyright (c) 2024-present, microforest-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod builder;
pub(crate) mod node;

pub use builder::BuildParams;
pub use node::NodeLayout;

use crate::{
    coding::{DecodeError, EncodeError},
    file::rewrite_atomic,
    packed::{PackedVector, WORD_BITS},
    Label, ERROR_LABEL, MAX_TREES,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use node::{BuildingNode, InternalNode, MixedNode};
use std::{
    io::{Read, Write},
    path::Path,
};

pub const MAGIC_BYTES: [u8; 4] = [b'T', b'R', b'C', b'3'];

const FORMAT_VERSION: u8 = 3;

/// Descent cap; a corrupt tree terminates with the sentinel label
const MAX_DESCENT: u16 = 100;

/// One decision tree, in build form and/or compact form.
///
/// The build form is a breadth-first array of packed building-node records.
/// Conversion splits branches into *internal* (children share a kind) and
/// *mixed* (one leaf child) vectors plus a `branch_kind` bitmap; a
/// prefix-popcount index over that bitmap maps branch indices to vector
/// slots in O(1) during descent.
#[derive(Clone, Debug)]
pub struct Tree {
    pub(crate) index: u8,

    /// Build-time nodes; cleared after conversion
    pub(crate) nodes: PackedVector,

    internal: PackedVector,
    mixed: PackedVector,
    leaves: PackedVector,

    /// 1 bit per branch: 0 = internal, 1 = mixed
    branch_kind: PackedVector,

    /// Cumulative popcount of `branch_kind` words, rebuilt after load
    mixed_prefix: Vec<u32>,

    pub(crate) root_is_leaf: bool,
    pub(crate) root_index: usize,
    pub(crate) depth: u16,

    /// Bootstrap bag (sorted sample IDs) used to train this tree
    pub(crate) bootstrap: Vec<u32>,

    pub(crate) loaded: bool,
}

impl Tree {
    #[must_use]
    pub fn new(index: u8) -> Self {
        Self {
            index,
            nodes: PackedVector::default(),
            internal: PackedVector::default(),
            mixed: PackedVector::default(),
            leaves: PackedVector::default(),
            branch_kind: PackedVector::with_bits(1),
            mixed_prefix: Vec::new(),
            root_is_leaf: false,
            root_index: 0,
            depth: 0,
            bootstrap: Vec::new(),
            loaded: false,
        }
    }

    #[must_use]
    pub fn index(&self) -> u8 {
        self.index
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    #[must_use]
    pub fn depth(&self) -> u16 {
        self.depth
    }

    #[must_use]
    pub fn bootstrap_ids(&self) -> &[u32] {
        &self.bootstrap
    }

    /// Total node count, preferring the compact form when present.
    #[must_use]
    pub fn count_nodes(&self) -> usize {
        let compact = self.internal.len() + self.mixed.len() + self.leaves.len();
        if compact > 0 {
            compact
        } else {
            self.nodes.len()
        }
    }

    #[must_use]
    pub fn count_leaves(&self) -> usize {
        if !self.leaves.is_empty() {
            return self.leaves.len();
        }
        (0..self.nodes.len())
            .filter(|i| BuildingNode(self.nodes.get(*i)).is_leaf())
            .count()
    }

    #[must_use]
    pub(crate) fn has_compact(&self) -> bool {
        self.internal.len() + self.mixed.len() + self.leaves.len() > 0
    }

    /// Drops all node storage.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.nodes.fit();
        self.internal.clear();
        self.internal.fit();
        self.mixed.clear();
        self.mixed.fit();
        self.leaves.clear();
        self.leaves.fit();
        self.branch_kind.set_bits_per_value(1);
        self.branch_kind.fit();
        self.mixed_prefix.clear();
        self.loaded = false;
    }

    /// Converts build-time nodes into the compact three-vector form.
    ///
    /// Build nodes are dropped afterwards to reclaim RAM. Fails on an empty
    /// tree or a child index pointing outside the node array.
    pub fn convert_to_compact(&mut self, layout: &NodeLayout) -> bool {
        if self.nodes.is_empty() {
            return false;
        }

        self.internal.set_bits_per_value(layout.internal_bits());
        self.mixed.set_bits_per_value(layout.mixed_bits());
        self.leaves.set_bits_per_value(layout.leaf_bits());
        self.branch_kind.set_bits_per_value(1);
        self.mixed_prefix.clear();

        let node_count = self.nodes.len();
        const UNSET: usize = usize::MAX;

        // Pass 1: dense leaf / branch numbering in old order
        let mut old_to_leaf = vec![UNSET; node_count];
        let mut old_to_branch = vec![UNSET; node_count];

        let mut branch_count = 0usize;
        for i in 0..node_count {
            let n = BuildingNode(self.nodes.get(i));
            if n.is_leaf() {
                old_to_leaf[i] = self.leaves.len();
                self.leaves.push(n.label(layout));
            } else {
                old_to_branch[i] = branch_count;
                branch_count += 1;
            }
        }

        let root = BuildingNode(self.nodes.get(0));
        self.root_is_leaf = root.is_leaf();
        self.root_index = if self.root_is_leaf {
            old_to_leaf[0]
        } else {
            old_to_branch[0]
        };

        // Pass 2: emit branches; the children's kinds decide the vector
        for i in 0..node_count {
            let n = BuildingNode(self.nodes.get(i));
            if n.is_leaf() {
                continue;
            }

            let left_old = n.left_child(layout);
            let right_old = left_old + 1;
            if left_old >= node_count || right_old >= node_count {
                return false;
            }

            let left_leaf = BuildingNode(self.nodes.get(left_old)).is_leaf();
            let right_leaf = BuildingNode(self.nodes.get(right_old)).is_leaf();

            let feature = n.feature(layout);
            let threshold = n.threshold(layout);

            if left_leaf == right_leaf {
                let left_new = if left_leaf {
                    old_to_leaf[left_old]
                } else {
                    old_to_branch[left_old]
                };
                self.internal.push(
                    InternalNode::new(left_leaf, threshold, feature, left_new, layout).0,
                );
                self.branch_kind.push(0);
            } else {
                let left_new = if left_leaf {
                    old_to_leaf[left_old]
                } else {
                    old_to_branch[left_old]
                };
                let right_new = if right_leaf {
                    old_to_leaf[right_old]
                } else {
                    old_to_branch[right_old]
                };
                self.mixed.push(
                    MixedNode::new(left_leaf, threshold, feature, left_new, right_new, layout).0,
                );
                self.branch_kind.push(1);
            }
        }

        self.rebuild_compact_index();

        self.nodes.clear();
        self.nodes.fit();
        true
    }

    /// Rebuilds the rank index after conversion or load.
    pub(crate) fn rebuild_compact_index(&mut self) {
        self.mixed_prefix.clear();
        let words = self.branch_kind.words();
        self.mixed_prefix.reserve(words + 1);
        self.mixed_prefix.push(0);

        let mut acc = 0u32;
        for word in self.branch_kind.raw_words().iter().take(words) {
            acc += word.count_ones();
            self.mixed_prefix.push(acc);
        }
    }

    /// Number of mixed branches strictly before `branch_index`.
    fn rank_mixed(&self, branch_index: usize) -> usize {
        let wi = branch_index / WORD_BITS;
        let bi = branch_index % WORD_BITS;

        let Some(base) = self.mixed_prefix.get(wi) else {
            return 0;
        };
        let Some(word) = self.branch_kind.raw_words().get(wi) else {
            return *base as usize;
        };

        let mask = if bi == 0 {
            0
        } else {
            (1usize << bi).wrapping_sub(1)
        };
        *base as usize + (word & mask).count_ones() as usize
    }

    /// Classifies a packed feature vector by descending the compact form.
    ///
    /// Returns [`ERROR_LABEL`] on an empty or corrupt tree; descent is
    /// capped so a malformed file can never loop forever.
    #[must_use]
    pub fn predict_features(&self, features: &PackedVector, layout: &NodeLayout) -> Label {
        if self.leaves.is_empty() {
            return ERROR_LABEL;
        }

        let leaf_at = |index: usize| -> Label {
            if index < self.leaves.len() {
                #[allow(clippy::cast_possible_truncation)]
                {
                    self.leaves.get(index) as Label
                }
            } else {
                ERROR_LABEL
            }
        };

        if self.root_is_leaf {
            return leaf_at(self.root_index);
        }

        let branch_count = self.branch_kind.len();
        let mut current = self.root_index;

        let mut budget = MAX_DESCENT;
        while budget > 0 {
            budget -= 1;

            if current >= branch_count {
                return ERROR_LABEL;
            }

            let mixed_before = self.rank_mixed(current);

            if self.branch_kind.get(current) == 0 {
                let node = InternalNode(self.internal.get(current - mixed_before));
                let value = features.get(node.feature(layout));
                let left = node.left_child(layout);
                let chosen = if value <= node.threshold(layout) {
                    left
                } else {
                    left + 1
                };

                if node.children_are_leaf() {
                    return leaf_at(chosen);
                }
                current = chosen;
            } else {
                let node = MixedNode(self.mixed.get(mixed_before));
                let value = features.get(node.feature(layout));
                let go_left = value <= node.threshold(layout);
                let left_is_leaf = node.left_is_leaf();

                if go_left {
                    let idx = node.left_child(layout);
                    if left_is_leaf {
                        return leaf_at(idx);
                    }
                    current = idx;
                } else {
                    let idx = node.right_child(layout);
                    if !left_is_leaf {
                        return leaf_at(idx);
                    }
                    current = idx;
                }
            }
        }

        ERROR_LABEL
    }

    /// Classifies by walking the build form; used to validate conversion.
    #[must_use]
    pub fn predict_build(&self, features: &PackedVector, layout: &NodeLayout) -> Label {
        if self.nodes.is_empty() {
            return ERROR_LABEL;
        }

        let mut current = 0usize;
        let mut budget = MAX_DESCENT;
        while budget > 0 {
            budget -= 1;

            if current >= self.nodes.len() {
                return ERROR_LABEL;
            }
            let node = BuildingNode(self.nodes.get(current));
            if node.is_leaf() {
                #[allow(clippy::cast_possible_truncation)]
                return node.label(layout) as Label;
            }

            let value = features.get(node.feature(layout));
            let left = node.left_child(layout);
            current = if value <= node.threshold(layout) {
                left
            } else {
                left + 1
            };
        }

        ERROR_LABEL
    }

    /// Writes the compact payload (everything but magic/version/layout).
    pub(crate) fn write_payload<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(u8::from(self.root_is_leaf))?;
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<LittleEndian>(self.root_index as u32)?;

        let branch_count = self.branch_kind.len();
        #[allow(clippy::cast_possible_truncation)]
        {
            writer.write_u32::<LittleEndian>(branch_count as u32)?;
            writer.write_u32::<LittleEndian>(self.internal.len() as u32)?;
            writer.write_u32::<LittleEndian>(self.mixed.len() as u32)?;
            writer.write_u32::<LittleEndian>(self.leaves.len() as u32)?;
        }

        writer.write_u8(self.internal.bits_per_value())?;
        writer.write_u8(self.mixed.bits_per_value())?;
        writer.write_u8(self.leaves.bits_per_value())?;

        // branch_kind as raw bytes, LSB-first
        let kind_bytes = branch_count.div_ceil(8);
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<LittleEndian>(kind_bytes as u32)?;
        for byte_index in 0..kind_bytes {
            let mut out = 0u8;
            for bit in 0..8 {
                let i = byte_index * 8 + bit;
                if i < branch_count {
                    #[allow(clippy::cast_possible_truncation)]
                    {
                        out |= (self.branch_kind.get(i) as u8 & 1) << bit;
                    }
                }
            }
            writer.write_u8(out)?;
        }

        write_stream(writer, &self.internal)?;
        write_stream(writer, &self.mixed)?;
        write_stream(writer, &self.leaves)?;

        Ok(())
    }

    /// Reads the compact payload, replacing any current node storage.
    pub(crate) fn read_payload<R: Read>(&mut self, reader: &mut R) -> Result<(), DecodeError> {
        self.root_is_leaf = reader.read_u8()? != 0;
        self.root_index = reader.read_u32::<LittleEndian>()? as usize;

        let branch_count = reader.read_u32::<LittleEndian>()? as usize;
        let internal_count = reader.read_u32::<LittleEndian>()? as usize;
        let mixed_count = reader.read_u32::<LittleEndian>()? as usize;
        let leaf_count = reader.read_u32::<LittleEndian>()? as usize;

        let internal_bits = reader.read_u8()?;
        let mixed_bits = reader.read_u8()?;
        let leaf_bits = reader.read_u8()?;

        self.internal.set_bits_per_value(internal_bits);
        self.mixed.set_bits_per_value(mixed_bits);
        self.leaves.set_bits_per_value(leaf_bits);
        self.branch_kind.set_bits_per_value(1);
        self.mixed_prefix.clear();

        let kind_bytes = reader.read_u32::<LittleEndian>()? as usize;
        self.branch_kind.resize(branch_count, 0);
        for byte_index in 0..kind_bytes {
            let byte = reader.read_u8()?;
            for bit in 0..8 {
                let i = byte_index * 8 + bit;
                if i < branch_count {
                    self.branch_kind
                        .set(i, usize::from((byte >> bit) & 1));
                }
            }
        }

        read_stream(reader, &mut self.internal, internal_count)?;
        read_stream(reader, &mut self.mixed, mixed_count)?;
        read_stream(reader, &mut self.leaves, leaf_count)?;

        self.nodes.clear();
        self.nodes.fit();
        self.rebuild_compact_index();
        self.loaded = true;
        Ok(())
    }

    /// Writes the tree to a `TRC3` file, keeping it in RAM.
    ///
    /// The file is replaced atomically, so a crash mid-save leaves the
    /// previous tree usable.
    pub fn save_to(&self, path: &Path, layout: &NodeLayout) -> crate::Result<()> {
        if !self.has_compact() {
            return Err(crate::Error::Incompatible("tree has no compact nodes to save"));
        }

        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC_BYTES);
        buf.push(FORMAT_VERSION);
        buf.push(layout.threshold_bits);
        buf.push(layout.feature_bits);
        buf.push(layout.label_bits);
        buf.push(layout.child_bits);
        self.write_payload(&mut buf)?;

        rewrite_atomic(path, &buf)?;
        log::trace!("tree {} saved to {path:?}", self.index);
        Ok(())
    }

    /// Saves the tree to its `TRC3` file and drops node storage.
    ///
    /// A build-form tree is converted first.
    pub fn release(&mut self, path: &Path, layout: &NodeLayout) -> crate::Result<()> {
        if usize::from(self.index) >= usize::from(MAX_TREES) && !self.has_compact() {
            return Err(crate::Error::Incompatible("invalid tree index"));
        }

        if !self.has_compact() && !self.convert_to_compact(layout) {
            return Err(crate::Error::Incompatible("tree has no nodes to save"));
        }

        self.save_to(path, layout)?;
        self.clear();
        Ok(())
    }

    /// Loads a `TRC3` file; the persisted bit widths overwrite `layout`.
    ///
    /// Any short read or version mismatch aborts and clears partial state.
    pub fn load(&mut self, path: &Path, layout: &mut NodeLayout) -> crate::Result<()> {
        if self.loaded {
            return Ok(());
        }

        match self.load_inner(path, layout) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.clear();
                Err(e)
            }
        }
    }

    fn load_inner(&mut self, path: &Path, layout: &mut NodeLayout) -> crate::Result<()> {
        let mut file = std::fs::File::open(path)?;

        let mut magic = [0u8; MAGIC_BYTES.len()];
        file.read_exact(&mut magic)?;
        if magic != MAGIC_BYTES {
            return Err(DecodeError::InvalidHeader("Tree").into());
        }

        let version = file.read_u8()?;
        if version != FORMAT_VERSION {
            return Err(DecodeError::UnsupportedVersion(version).into());
        }

        let threshold_bits = file.read_u8()?;
        let feature_bits = file.read_u8()?;
        let label_bits = file.read_u8()?;
        let child_bits = file.read_u8()?;
        *layout = NodeLayout::from_bits(threshold_bits, feature_bits, label_bits, child_bits);

        self.read_payload(&mut file)?;
        Ok(())
    }
}

fn write_stream<W: Write>(writer: &mut W, vector: &PackedVector) -> Result<(), EncodeError> {
    let bytes = usize::from(vector.bits_per_value()).div_ceil(8);
    for i in 0..vector.len() {
        let value = vector.get(i) as u64;
        for b in 0..bytes {
            #[allow(clippy::cast_possible_truncation)]
            writer.write_u8(((value >> (8 * b)) & 0xFF) as u8)?;
        }
    }
    Ok(())
}

fn read_stream<R: Read>(
    reader: &mut R,
    vector: &mut PackedVector,
    count: usize,
) -> Result<(), DecodeError> {
    let bytes = usize::from(vector.bits_per_value()).div_ceil(8);
    vector.clear();
    vector.reserve(count);
    for _ in 0..count {
        let mut value = 0u64;
        for b in 0..bytes {
            value |= u64::from(reader.read_u8()?) << (8 * b);
        }
        #[allow(clippy::cast_possible_truncation)]
        vector.push(value as usize);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn layout() -> NodeLayout {
        NodeLayout::from_bits(2, 2, 2, 6)
    }

    /// Hand-builds:  root(f0 <= 1) -> {leaf 0, split(f1 <= 0) -> {leaf 1, leaf 2}}
    fn hand_built_tree() -> Tree {
        let layout = layout();
        let mut tree = Tree::new(0);
        tree.nodes.set_bits_per_value(layout.building_bits());

        tree.nodes.push(BuildingNode::split(0, 1, 1, &layout).0);
        tree.nodes.push(BuildingNode::leaf(0, &layout).0);
        tree.nodes.push(BuildingNode::split(1, 0, 3, &layout).0);
        tree.nodes.push(BuildingNode::leaf(1, &layout).0);
        tree.nodes.push(BuildingNode::leaf(2, &layout).0);
        tree
    }

    fn features(values: &[usize]) -> PackedVector {
        let mut v = PackedVector::with_bits(2);
        for value in values {
            v.push(*value);
        }
        v
    }

    #[test]
    fn compact_conversion_preserves_predictions() {
        let layout = layout();
        let mut tree = hand_built_tree();

        let inputs = [
            features(&[0, 0]),
            features(&[1, 3]),
            features(&[2, 0]),
            features(&[3, 1]),
            features(&[2, 3]),
        ];

        let build_predictions: Vec<Label> = inputs
            .iter()
            .map(|f| tree.predict_build(f, &layout))
            .collect();

        assert!(tree.convert_to_compact(&layout));
        assert!(tree.nodes.is_empty());

        let compact_predictions: Vec<Label> = inputs
            .iter()
            .map(|f| tree.predict_features(f, &layout))
            .collect();

        assert_eq!(build_predictions, compact_predictions);
        assert_eq!(vec![0, 0, 1, 2, 2], compact_predictions);
    }

    #[test]
    fn compact_counts() {
        let layout = layout();
        let mut tree = hand_built_tree();
        assert_eq!(5, tree.count_nodes());
        assert_eq!(3, tree.count_leaves());

        tree.convert_to_compact(&layout);
        assert_eq!(5, tree.count_nodes());
        assert_eq!(3, tree.count_leaves());
        // Root is mixed (left child leaf, right child branch), inner split
        // has two leaf children
        assert_eq!(1, tree.mixed.len());
        assert_eq!(1, tree.internal.len());
    }

    #[test]
    fn rank_matches_naive_count() {
        let layout = layout();
        let mut tree = hand_built_tree();
        tree.convert_to_compact(&layout);

        for b in 0..tree.branch_kind.len() {
            let naive = (0..b).filter(|i| tree.branch_kind.get(*i) == 1).count();
            assert_eq!(naive, tree.rank_mixed(b), "branch {b}");
        }
    }

    #[test]
    fn leaf_only_tree() {
        let layout = layout();
        let mut tree = Tree::new(0);
        tree.nodes.set_bits_per_value(layout.building_bits());
        tree.nodes.push(BuildingNode::leaf(2, &layout).0);

        assert!(tree.convert_to_compact(&layout));
        assert!(tree.root_is_leaf);
        assert_eq!(2, tree.predict_features(&features(&[0, 0]), &layout));
    }

    #[test]
    fn empty_tree_predicts_error_label() {
        let layout = layout();
        let tree = Tree::new(0);
        assert_eq!(ERROR_LABEL, tree.predict_features(&features(&[0, 0]), &layout));
    }

    #[test]
    fn tree_file_round_trip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tree_0.bin");

        let mut layout = layout();
        let mut tree = hand_built_tree();
        tree.convert_to_compact(&layout);

        let expected: Vec<Label> = (0..4)
            .map(|a| tree.predict_features(&features(&[a, 1]), &layout))
            .collect();

        tree.release(&path, &layout)?;
        assert!(!tree.has_compact());

        let mut copy = Tree::new(0);
        copy.load(&path, &mut layout)?;

        let got: Vec<Label> = (0..4)
            .map(|a| copy.predict_features(&features(&[a, 1]), &layout))
            .collect();
        assert_eq!(expected, got);

        Ok(())
    }

    #[test]
    fn tree_load_rejects_bad_magic() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tree_0.bin");
        std::fs::write(&path, b"LSM3somegarbage")?;

        let mut layout = layout();
        let mut tree = Tree::new(0);
        assert!(tree.load(&path, &mut layout).is_err());
        assert!(!tree.is_loaded());

        Ok(())
    }

    #[test]
    fn tree_load_rejects_truncated_file() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tree_0.bin");

        let mut layout = layout();
        let mut tree = hand_built_tree();
        tree.convert_to_compact(&layout);
        tree.release(&path, &layout)?;

        let bytes = std::fs::read(&path)?;
        std::fs::write(&path, &bytes[..bytes.len() / 2])?;

        let mut copy = Tree::new(0);
        assert!(copy.load(&path, &mut layout).is_err());
        assert!(!copy.is_loaded());
        assert_eq!(0, copy.count_nodes());

        Ok(())
    }
}
