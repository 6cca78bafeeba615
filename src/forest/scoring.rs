// Copyright (c) 2024-present, microforest-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::packed_row;
use crate::{
    config::Config,
    dataset::Dataset,
    metrics::MatrixScore,
    packed::PackedVector,
    tree::{NodeLayout, Tree},
    Label, ERROR_LABEL,
};
use rustc_hash::FxHashMap;

/// Labels small enough to tally votes in a stack array
const STACK_VOTE_LABELS: usize = 32;

/// Majority vote over a set of trees; ties break to the lowest label.
///
/// Label counts up to 32 use a stack array; larger label spaces fall back
/// to a hash map. Returns [`ERROR_LABEL`] when no tree votes.
pub(crate) fn majority_vote<'a>(
    trees: impl Iterator<Item = &'a Tree>,
    features: &PackedVector,
    num_labels: Label,
    layout: &NodeLayout,
) -> Label {
    if usize::from(num_labels) <= STACK_VOTE_LABELS {
        let mut votes = [0u8; STACK_VOTE_LABELS];

        for tree in trees {
            let predicted = tree.predict_features(features, layout);
            if predicted < num_labels {
                votes[usize::from(predicted)] += 1;
            }
        }

        let mut best_votes = 0u8;
        let mut best_label = ERROR_LABEL;
        for (label, count) in votes.iter().enumerate().take(usize::from(num_labels)) {
            // Strictly greater keeps ties at the lowest label
            if *count > best_votes {
                best_votes = *count;
                #[allow(clippy::cast_possible_truncation)]
                {
                    best_label = label as Label;
                }
            }
        }
        best_label
    } else {
        let mut votes: FxHashMap<Label, u32> = FxHashMap::default();

        for tree in trees {
            let predicted = tree.predict_features(features, layout);
            if predicted < num_labels {
                *votes.entry(predicted).or_insert(0) += 1;
            }
        }

        let mut best_votes = 0u32;
        let mut best_label = ERROR_LABEL;
        for (label, count) in votes {
            if count > best_votes || (count == best_votes && label < best_label) {
                best_votes = count;
                best_label = label;
            }
        }
        if best_votes == 0 {
            ERROR_LABEL
        } else {
            best_label
        }
    }
}

/// Out-of-bag score: each sample is evaluated only by trees whose
/// bootstrap bag excluded it.
pub(super) fn oob_score(
    trees: &[Tree],
    data: &Dataset,
    config: &Config,
    layout: &NodeLayout,
) -> f32 {
    let mut matrix = MatrixScore::new(config.num_labels, config.metric_mask);

    for sample in 0..data.len() {
        #[allow(clippy::cast_possible_truncation)]
        let id = sample as u32;
        let out_of_bag = trees
            .iter()
            .filter(|tree| tree.bootstrap_ids().binary_search(&id).is_err());

        let features = packed_row(data, sample);
        let predicted = majority_vote(out_of_bag, &features, config.num_labels, layout);
        matrix.update_prediction(data.get_label(sample), predicted);
    }

    if matrix.total_predictions() == 0 {
        log::warn!("no out-of-bag samples; is bootstrapping disabled?");
    }
    matrix.calculate_score()
}

/// Holdout score over the reserved validation samples.
pub(super) fn holdout_score(
    trees: &[Tree],
    data: &Dataset,
    valid_ids: &[u32],
    config: &Config,
    layout: &NodeLayout,
) -> f32 {
    let mut matrix = MatrixScore::new(config.num_labels, config.metric_mask);

    for id in valid_ids {
        let sample = *id as usize;
        let features = packed_row(data, sample);
        let predicted = majority_vote(trees.iter(), &features, config.num_labels, layout);
        matrix.update_prediction(data.get_label(sample), predicted);
    }

    matrix.calculate_score()
}

/// K-fold score: each fold is predicted by the trees that excluded it.
pub(super) fn kfold_score(
    trees: &[Tree],
    data: &Dataset,
    config: &Config,
    layout: &NodeLayout,
) -> f32 {
    let k = u32::from(config.k_folds.max(2));
    let mut matrix = MatrixScore::new(config.num_labels, config.metric_mask);

    for sample in 0..data.len() {
        #[allow(clippy::cast_possible_truncation)]
        let fold = sample as u32 % k;
        let excluding = trees
            .iter()
            .filter(|tree| u32::from(tree.index()) % k == fold);

        let features = packed_row(data, sample);
        let predicted = majority_vote(excluding, &features, config.num_labels, layout);
        matrix.update_prediction(data.get_label(sample), predicted);
    }

    matrix.calculate_score()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::node::BuildingNode;
    use test_log::test;

    fn leaf_tree(index: u8, label: usize, layout: &NodeLayout) -> Tree {
        let mut tree = Tree::new(index);
        tree.nodes.set_bits_per_value(layout.building_bits());
        tree.nodes.push(BuildingNode::leaf(label, layout).0);
        assert!(tree.convert_to_compact(layout));
        tree
    }

    #[test]
    fn vote_tie_breaks_to_lowest_label() {
        let layout = NodeLayout::from_bits(2, 2, 2, 6);

        // Votes 2/2/1 over three labels
        let trees = [
            leaf_tree(0, 0, &layout),
            leaf_tree(1, 0, &layout),
            leaf_tree(2, 1, &layout),
            leaf_tree(3, 1, &layout),
            leaf_tree(4, 2, &layout),
        ];

        let mut features = PackedVector::with_bits(2);
        features.push(0);
        features.push(0);

        assert_eq!(0, majority_vote(trees.iter(), &features, 3, &layout));
    }

    #[test]
    fn vote_without_trees_is_error_label() {
        let layout = NodeLayout::from_bits(2, 2, 2, 6);
        let features = PackedVector::with_bits(2);
        let no_trees: [Tree; 0] = [];
        assert_eq!(
            ERROR_LABEL,
            majority_vote(no_trees.iter(), &features, 3, &layout)
        );
    }

    #[test]
    fn vote_large_label_space_uses_map_path() {
        let layout = NodeLayout::from_bits(2, 2, 8, 6);

        let trees = [
            leaf_tree(0, 40, &layout),
            leaf_tree(1, 40, &layout),
            leaf_tree(2, 39, &layout),
            leaf_tree(3, 39, &layout),
            leaf_tree(4, 41, &layout),
        ];

        let mut features = PackedVector::with_bits(2);
        features.push(0);

        // Tie between 39 and 40 resolves to the lower label
        assert_eq!(39, majority_vote(trees.iter(), &features, 64, &layout));
    }
}
