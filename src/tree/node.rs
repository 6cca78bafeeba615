// Copyright (c) 2024-present, microforest-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Safety fallback for child index width (13 bits)
const FALLBACK_NODE_INDEX: u32 = 8_191;

/// Bit budget for one build-time node record
const BUILDING_NODE_WORD: u8 = 32;

fn bits_required(mut max_value: u32) -> u8 {
    let mut bits = 0u8;
    loop {
        bits += 1;
        max_value >>= 1;
        if max_value == 0 || bits >= 32 {
            break;
        }
    }
    bits.max(1)
}

/// Bit widths shared by every node record of a forest.
///
/// Owned by the forest; trees borrow it at build, convert and predict time.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NodeLayout {
    pub threshold_bits: u8,
    pub feature_bits: u8,
    pub label_bits: u8,
    pub child_bits: u8,
}

impl NodeLayout {
    /// Creates a layout from explicit widths (e.g. a config file).
    #[must_use]
    pub fn from_bits(threshold_bits: u8, feature_bits: u8, label_bits: u8, child_bits: u8) -> Self {
        Self {
            threshold_bits,
            feature_bits,
            label_bits,
            child_bits,
        }
    }

    /// Derives widths from the model dimensions.
    ///
    /// The threshold width follows the quantization coefficient but is
    /// reduced (never below 1) until the child index fits the 32-bit
    /// building-node budget alongside the other fields.
    #[must_use]
    pub fn calculate(num_labels: u16, num_features: u16, max_nodes: u32, quant_bits: u8) -> Self {
        let max_label_id = u32::from(num_labels.saturating_sub(1));
        let max_feature_id = u32::from(num_features.saturating_sub(1));
        let max_node_index = max_nodes.saturating_sub(1).min(FALLBACK_NODE_INDEX);

        let label_bits = bits_required(max_label_id).min(8);
        let feature_bits = bits_required(max_feature_id).min(10);
        let mut threshold_bits = quant_bits.clamp(1, 8);

        let max_child_bits_limit = bits_required(FALLBACK_NODE_INDEX);
        let desired_child_bits = bits_required(max_node_index)
            .min(max_child_bits_limit)
            .max(1);

        let available = |t_bits: u8| -> u8 {
            let used = 1 + t_bits + feature_bits + label_bits;
            if used >= BUILDING_NODE_WORD {
                0
            } else {
                BUILDING_NODE_WORD - used
            }
        };

        let mut available_child_bits = available(threshold_bits);
        while threshold_bits > 1 && available_child_bits < desired_child_bits {
            threshold_bits -= 1;
            available_child_bits = available(threshold_bits);
        }
        if available_child_bits == 0 {
            threshold_bits = 1;
            available_child_bits = available(threshold_bits);
        }

        if threshold_bits < quant_bits {
            log::debug!("adjusted threshold bits from {quant_bits} to {threshold_bits}");
        }

        let child_bits = if available_child_bits == 0 {
            1
        } else {
            desired_child_bits
                .min(available_child_bits)
                .min(max_child_bits_limit)
                .max(1)
        };

        log::debug!(
            "calculated node layout: threshold={threshold_bits} feature={feature_bits} \
             label={label_bits} child={child_bits}"
        );

        Self {
            threshold_bits,
            feature_bits,
            label_bits,
            child_bits,
        }
    }

    /// Width of one build-time node record.
    #[must_use]
    pub fn building_bits(&self) -> u8 {
        1 + self.threshold_bits + self.feature_bits + self.label_bits + self.child_bits
    }

    /// Width of one internal (same-kind children) record.
    #[must_use]
    pub fn internal_bits(&self) -> u8 {
        1 + self.threshold_bits + self.feature_bits + self.child_bits
    }

    /// Width of one mixed (one leaf child) record.
    #[must_use]
    pub fn mixed_bits(&self) -> u8 {
        1 + self.threshold_bits + self.feature_bits + 2 * self.child_bits
    }

    /// Width of one leaf record.
    #[must_use]
    pub fn leaf_bits(&self) -> u8 {
        self.label_bits
    }
}

fn mask(bits: u8) -> usize {
    if usize::from(bits) >= usize::BITS as usize {
        usize::MAX
    } else {
        (1usize << bits) - 1
    }
}

fn field(packed: usize, offset: u8, bits: u8) -> usize {
    (packed >> offset) & mask(bits)
}

/// Build-time node: `is_leaf | threshold | feature | label | left_child`,
/// LSB-first. Children sit at consecutive indices, so only the left one is
/// stored.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BuildingNode(pub usize);

impl BuildingNode {
    #[must_use]
    pub fn leaf(label: usize, layout: &NodeLayout) -> Self {
        let label_offset = 1 + layout.threshold_bits + layout.feature_bits;
        Self(1 | ((label & mask(layout.label_bits)) << label_offset))
    }

    #[must_use]
    pub fn split(feature: usize, threshold: usize, left_child: usize, layout: &NodeLayout) -> Self {
        let feature_offset = 1 + layout.threshold_bits;
        let child_offset = feature_offset + layout.feature_bits + layout.label_bits;
        Self(
            ((threshold & mask(layout.threshold_bits)) << 1)
                | ((feature & mask(layout.feature_bits)) << feature_offset)
                | ((left_child & mask(layout.child_bits)) << child_offset),
        )
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.0 & 1 != 0
    }

    #[must_use]
    pub fn threshold(&self, layout: &NodeLayout) -> usize {
        field(self.0, 1, layout.threshold_bits)
    }

    #[must_use]
    pub fn feature(&self, layout: &NodeLayout) -> usize {
        field(self.0, 1 + layout.threshold_bits, layout.feature_bits)
    }

    #[must_use]
    pub fn label(&self, layout: &NodeLayout) -> usize {
        field(
            self.0,
            1 + layout.threshold_bits + layout.feature_bits,
            layout.label_bits,
        )
    }

    #[must_use]
    pub fn left_child(&self, layout: &NodeLayout) -> usize {
        field(
            self.0,
            1 + layout.threshold_bits + layout.feature_bits + layout.label_bits,
            layout.child_bits,
        )
    }
}

/// Compact branch whose children share a kind:
/// `children_are_leaf | threshold | feature | left_child`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InternalNode(pub usize);

impl InternalNode {
    #[must_use]
    pub fn new(
        children_are_leaf: bool,
        threshold: usize,
        feature: usize,
        left_child: usize,
        layout: &NodeLayout,
    ) -> Self {
        let feature_offset = 1 + layout.threshold_bits;
        let child_offset = feature_offset + layout.feature_bits;
        Self(
            usize::from(children_are_leaf)
                | ((threshold & mask(layout.threshold_bits)) << 1)
                | ((feature & mask(layout.feature_bits)) << feature_offset)
                | ((left_child & mask(layout.child_bits)) << child_offset),
        )
    }

    #[must_use]
    pub fn children_are_leaf(&self) -> bool {
        self.0 & 1 != 0
    }

    #[must_use]
    pub fn threshold(&self, layout: &NodeLayout) -> usize {
        field(self.0, 1, layout.threshold_bits)
    }

    #[must_use]
    pub fn feature(&self, layout: &NodeLayout) -> usize {
        field(self.0, 1 + layout.threshold_bits, layout.feature_bits)
    }

    #[must_use]
    pub fn left_child(&self, layout: &NodeLayout) -> usize {
        field(
            self.0,
            1 + layout.threshold_bits + layout.feature_bits,
            layout.child_bits,
        )
    }
}

/// Compact branch with exactly one leaf child:
/// `left_is_leaf | threshold | feature | left_child | right_child`.
///
/// Both child indices are stored because they live in different vectors.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MixedNode(pub usize);

impl MixedNode {
    #[must_use]
    pub fn new(
        left_is_leaf: bool,
        threshold: usize,
        feature: usize,
        left_child: usize,
        right_child: usize,
        layout: &NodeLayout,
    ) -> Self {
        let feature_offset = 1 + layout.threshold_bits;
        let left_offset = feature_offset + layout.feature_bits;
        let right_offset = left_offset + layout.child_bits;
        Self(
            usize::from(left_is_leaf)
                | ((threshold & mask(layout.threshold_bits)) << 1)
                | ((feature & mask(layout.feature_bits)) << feature_offset)
                | ((left_child & mask(layout.child_bits)) << left_offset)
                | ((right_child & mask(layout.child_bits)) << right_offset),
        )
    }

    #[must_use]
    pub fn left_is_leaf(&self) -> bool {
        self.0 & 1 != 0
    }

    #[must_use]
    pub fn threshold(&self, layout: &NodeLayout) -> usize {
        field(self.0, 1, layout.threshold_bits)
    }

    #[must_use]
    pub fn feature(&self, layout: &NodeLayout) -> usize {
        field(self.0, 1 + layout.threshold_bits, layout.feature_bits)
    }

    #[must_use]
    pub fn left_child(&self, layout: &NodeLayout) -> usize {
        field(
            self.0,
            1 + layout.threshold_bits + layout.feature_bits,
            layout.child_bits,
        )
    }

    #[must_use]
    pub fn right_child(&self, layout: &NodeLayout) -> usize {
        field(
            self.0,
            1 + layout.threshold_bits + layout.feature_bits + layout.child_bits,
            layout.child_bits,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn layout() -> NodeLayout {
        NodeLayout::from_bits(3, 5, 4, 10)
    }

    #[test]
    fn building_node_round_trip() {
        let layout = layout();

        let leaf = BuildingNode::leaf(9, &layout);
        assert!(leaf.is_leaf());
        assert_eq!(9, leaf.label(&layout));

        let split = BuildingNode::split(17, 5, 600, &layout);
        assert!(!split.is_leaf());
        assert_eq!(17, split.feature(&layout));
        assert_eq!(5, split.threshold(&layout));
        assert_eq!(600, split.left_child(&layout));
    }

    #[test]
    fn internal_node_round_trip() {
        let layout = layout();

        let node = InternalNode::new(true, 7, 31, 1_000, &layout);
        assert!(node.children_are_leaf());
        assert_eq!(7, node.threshold(&layout));
        assert_eq!(31, node.feature(&layout));
        assert_eq!(1_000, node.left_child(&layout));
    }

    #[test]
    fn mixed_node_round_trip() {
        let layout = layout();

        let node = MixedNode::new(false, 2, 8, 123, 456, &layout);
        assert!(!node.left_is_leaf());
        assert_eq!(2, node.threshold(&layout));
        assert_eq!(8, node.feature(&layout));
        assert_eq!(123, node.left_child(&layout));
        assert_eq!(456, node.right_child(&layout));
    }

    #[test]
    fn layout_calculate_clamps_threshold() {
        // 2 labels, 2 features, tiny trees: plenty of room
        let small = NodeLayout::calculate(2, 2, 8, 2);
        assert_eq!(2, small.threshold_bits);
        assert_eq!(1, small.label_bits);
        assert_eq!(1, small.feature_bits);
        assert!(small.building_bits() <= 32);

        // Wide features + 8-bit labels squeeze the child field
        let big = NodeLayout::calculate(255, 1_000, 262_144, 8);
        assert!(big.building_bits() <= 32);
        assert!(big.child_bits >= 1);
    }

    #[test]
    fn layout_widths_are_consistent() {
        let l = layout();
        assert_eq!(1 + 3 + 5 + 4 + 10, l.building_bits());
        assert_eq!(1 + 3 + 5 + 10, l.internal_bits());
        assert_eq!(1 + 3 + 5 + 20, l.mixed_bits());
        assert_eq!(4, l.leaf_bits());
    }
}
