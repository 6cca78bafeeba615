// Copyright (c) 2024-present, microforest-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{node::BuildingNode, NodeLayout, Tree};
use crate::{dataset::Dataset, Label, MAX_NODES};
use std::collections::VecDeque;

/// Hyperparameters and capacity hints for one tree build.
#[derive(Clone, Debug)]
pub struct BuildParams {
    pub min_split: usize,
    pub min_leaf: usize,
    pub max_depth: u16,
    pub use_gini: bool,
    pub impurity_threshold: f32,
    pub num_labels: Label,

    /// Pre-reserved node storage, from the node-count predictor
    pub reserve_nodes: usize,

    /// Pre-reserved BFS frontier capacity
    pub queue_capacity: usize,
}

struct Frontier {
    node: usize,
    depth: u16,
    ids: Vec<u32>,
}

/// Class impurity over a histogram of `n` samples.
fn impurity(hist: &[u32], n: usize, use_gini: bool) -> f32 {
    if n == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = n as f32;

    if use_gini {
        // 1 - sum(p^2)
        let mut sum = 0.0f32;
        for count in hist {
            #[allow(clippy::cast_precision_loss)]
            let p = *count as f32 / n;
            sum += p * p;
        }
        1.0 - sum
    } else {
        // -sum(p * log2 p), with 0*log(0) == 0
        let mut sum = 0.0f32;
        for count in hist {
            if *count == 0 {
                continue;
            }
            #[allow(clippy::cast_precision_loss)]
            let p = *count as f32 / n;
            sum -= p * p.log2();
        }
        sum
    }
}

struct BestSplit {
    feature: u16,
    threshold: usize,
    gain: f32,
}

impl Tree {
    /// Builds the tree breadth-first over the given sample IDs.
    ///
    /// Nodes are expanded in FIFO order, so the tree shape is stable for a
    /// given seed and dataset. Children are placed at consecutive indices;
    /// only the left index is stored in the parent.
    pub fn build(
        &mut self,
        data: &Dataset,
        ids: &[u32],
        params: &BuildParams,
        layout: &NodeLayout,
    ) -> crate::Result<()> {
        if !data.is_loaded() || ids.is_empty() {
            return Err(crate::Error::Incompatible("no samples to build from"));
        }

        self.clear();
        self.nodes.set_bits_per_value(layout.building_bits());
        self.nodes.reserve(params.reserve_nodes);
        self.depth = 0;

        let num_labels = usize::from(params.num_labels);
        let num_features = data.total_features();
        let gpf = 1usize << data.quantization_coefficient();

        // Thresholds beyond the layout's width cannot be stored
        let threshold_slots = gpf.min(1 << layout.threshold_bits);

        let mut queue: VecDeque<Frontier> = VecDeque::with_capacity(params.queue_capacity);

        self.nodes.push(0);
        queue.push_back(Frontier {
            node: 0,
            depth: 0,
            ids: ids.to_vec(),
        });

        let mut hist = vec![0u32; num_labels];
        let mut bin_hist = vec![0u32; gpf * num_labels];
        let mut left_hist = vec![0u32; num_labels];

        while let Some(entry) = queue.pop_front() {
            let n = entry.ids.len();
            if entry.depth > self.depth {
                self.depth = entry.depth;
            }

            hist.fill(0);
            for id in &entry.ids {
                hist[usize::from(data.get_label(*id as usize))] += 1;
            }

            let majority = majority_label(&hist);
            let pure = hist.iter().filter(|c| **c > 0).count() <= 1;

            let force_leaf = n < params.min_split
                || entry.depth >= params.max_depth
                || pure
                || self.nodes.len() + 2 > MAX_NODES as usize;

            let split = if force_leaf {
                None
            } else {
                let parent_impurity = impurity(&hist, n, params.use_gini);
                best_split(
                    data,
                    &entry.ids,
                    &hist,
                    parent_impurity,
                    num_features,
                    threshold_slots,
                    params,
                    &mut bin_hist,
                    &mut left_hist,
                )
            };

            let Some(split) = split else {
                self.nodes
                    .set(entry.node, BuildingNode::leaf(majority, layout).0);
                continue;
            };

            // Children at consecutive indices; the right one is implicit
            let left_index = self.nodes.len();
            self.nodes.push(0);
            self.nodes.push(0);
            self.nodes.set(
                entry.node,
                BuildingNode::split(
                    usize::from(split.feature),
                    split.threshold,
                    left_index,
                    layout,
                )
                .0,
            );

            let mut left_ids = Vec::new();
            let mut right_ids = Vec::new();
            for id in &entry.ids {
                if data.get_feature(*id as usize, split.feature) <= split.threshold {
                    left_ids.push(*id);
                } else {
                    right_ids.push(*id);
                }
            }

            queue.push_back(Frontier {
                node: left_index,
                depth: entry.depth + 1,
                ids: left_ids,
            });
            queue.push_back(Frontier {
                node: left_index + 1,
                depth: entry.depth + 1,
                ids: right_ids,
            });
        }

        self.loaded = true;
        log::trace!(
            "tree {} built: {} nodes, depth {}",
            self.index,
            self.nodes.len(),
            self.depth
        );
        Ok(())
    }
}

fn majority_label(hist: &[u32]) -> usize {
    let mut best = 0usize;
    let mut best_count = 0u32;
    for (label, count) in hist.iter().enumerate() {
        // Strictly greater keeps ties at the lower label
        if *count > best_count {
            best_count = *count;
            best = label;
        }
    }
    best
}

/// Exhaustive (feature, threshold) search maximizing impurity gain.
///
/// Ties keep the first candidate found, which is the lowest feature id and
/// then the lowest threshold. Returns `None` when no candidate satisfies
/// `min_leaf` on both sides or the best gain stays below the threshold.
#[allow(clippy::too_many_arguments)]
fn best_split(
    data: &Dataset,
    ids: &[u32],
    parent_hist: &[u32],
    parent_impurity: f32,
    num_features: u16,
    threshold_slots: usize,
    params: &BuildParams,
    bin_hist: &mut [u32],
    left_hist: &mut [u32],
) -> Option<BestSplit> {
    let num_labels = parent_hist.len();
    let n = ids.len();
    let mut best: Option<BestSplit> = None;

    let mut right_hist = vec![0u32; num_labels];

    for feature in 0..num_features {
        bin_hist.fill(0);
        for id in ids {
            let bin = data.get_feature(*id as usize, feature);
            bin_hist[bin * num_labels + usize::from(data.get_label(*id as usize))] += 1;
        }

        left_hist.fill(0);
        let mut left_n = 0usize;

        // Candidate thresholds partition at bin <= t
        for t in 0..threshold_slots.saturating_sub(1) {
            for label in 0..num_labels {
                let c = bin_hist[t * num_labels + label];
                left_hist[label] += c;
                left_n += c as usize;
            }

            let right_n = n - left_n;
            if left_n < params.min_leaf || right_n < params.min_leaf {
                continue;
            }

            for label in 0..num_labels {
                right_hist[label] = parent_hist[label] - left_hist[label];
            }

            let left_impurity = impurity(left_hist, left_n, params.use_gini);
            let right_impurity = impurity(&right_hist, right_n, params.use_gini);

            #[allow(clippy::cast_precision_loss)]
            let weighted = (left_n as f32 * left_impurity + right_n as f32 * right_impurity)
                / n as f32;
            let gain = parent_impurity - weighted;

            if best.as_ref().is_none_or(|b| gain > b.gain) {
                best = Some(BestSplit {
                    feature,
                    threshold: t,
                    gain,
                });
            }
        }
    }

    match best {
        Some(b) if b.gain >= params.impurity_threshold && b.gain > 0.0 => Some(b),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Sample;
    use std::path::Path;
    use test_log::test;

    fn tiny_dataset(dir: &Path, q: u8, samples: &[Sample]) -> crate::Result<Dataset> {
        let path = dir.join("build.bin");
        #[allow(clippy::cast_possible_truncation)]
        let num_features = samples[0].features.len() as u16;
        let mut data = Dataset::new(path, q, num_features, 4)?;
        for (i, s) in samples.iter().enumerate() {
            data.store_sample(i, s.label, &s.features);
        }
        data.force_loaded();
        Ok(data)
    }

    fn params(num_labels: Label) -> BuildParams {
        BuildParams {
            min_split: 2,
            min_leaf: 1,
            max_depth: 3,
            use_gini: true,
            impurity_threshold: 0.0,
            num_labels,
            reserve_nodes: 64,
            queue_capacity: 30,
        }
    }

    fn s1_samples() -> Vec<Sample> {
        (0..8u8)
            .map(|i| {
                let label = u8::from(i >= 4);
                Sample {
                    label,
                    features: vec![label, 0],
                }
            })
            .collect()
    }

    #[test]
    fn tiny_balanced_tree() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let data = tiny_dataset(dir.path(), 1, &s1_samples())?;

        let layout = NodeLayout::calculate(2, 2, 64, 1);
        let mut tree = Tree::new(0);
        let ids: Vec<u32> = (0..8).collect();
        tree.build(&data, &ids, &params(2), &layout)?;

        // One root split on f0 plus two pure leaves
        assert_eq!(3, tree.count_nodes());
        assert_eq!(2, tree.count_leaves());
        assert_eq!(1, tree.depth());

        for i in 0..8usize {
            let mut f = crate::packed::PackedVector::with_bits(1);
            f.push(data.get_feature(i, 0));
            f.push(data.get_feature(i, 1));
            assert_eq!(data.get_label(i), tree.predict_build(&f, &layout));
        }

        Ok(())
    }

    #[test]
    fn build_respects_min_split() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let data = tiny_dataset(dir.path(), 1, &s1_samples())?;

        let layout = NodeLayout::calculate(2, 2, 64, 1);
        let mut p = params(2);
        p.min_split = 100;

        let mut tree = Tree::new(0);
        let ids: Vec<u32> = (0..8).collect();
        tree.build(&data, &ids, &p, &layout)?;

        // Too few samples to split: a single leaf
        assert_eq!(1, tree.count_nodes());
        assert_eq!(1, tree.count_leaves());

        Ok(())
    }

    #[test]
    fn build_respects_max_depth() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        // Needs two splits (f0 then f1) for purity
        let samples = vec![
            Sample { label: 0, features: vec![0, 0] },
            Sample { label: 0, features: vec![0, 1] },
            Sample { label: 1, features: vec![1, 0] },
            Sample { label: 2, features: vec![1, 1] },
        ];
        let data = tiny_dataset(dir.path(), 1, &samples)?;
        let layout = NodeLayout::calculate(3, 2, 64, 1);

        let mut p = params(3);
        p.max_depth = 1;

        let mut tree = Tree::new(0);
        tree.build(&data, &[0, 1, 2, 3], &p, &layout)?;
        assert!(tree.depth() <= 1);

        p.max_depth = 3;
        let mut deeper = Tree::new(1);
        deeper.build(&data, &[0, 1, 2, 3], &p, &layout)?;
        assert!(deeper.depth() == 2);

        for (i, s) in samples.iter().enumerate() {
            let mut f = crate::packed::PackedVector::with_bits(1);
            f.push(usize::from(s.features[0]));
            f.push(usize::from(s.features[1]));
            assert_eq!(data.get_label(i), deeper.predict_build(&f, &layout));
        }

        Ok(())
    }

    #[test]
    fn entropy_and_gini_agree_on_separable_data() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let data = tiny_dataset(dir.path(), 1, &s1_samples())?;
        let layout = NodeLayout::calculate(2, 2, 64, 1);

        let mut p = params(2);
        p.use_gini = false;

        let mut tree = Tree::new(0);
        tree.build(&data, &(0..8).collect::<Vec<_>>(), &p, &layout)?;
        assert_eq!(3, tree.count_nodes());

        Ok(())
    }

    #[test]
    fn impurity_values() {
        // Pure node
        assert!((impurity(&[4, 0], 4, true) - 0.0).abs() < 1e-6);
        // 50/50 Gini = 0.5, entropy = 1.0
        assert!((impurity(&[2, 2], 4, true) - 0.5).abs() < 1e-6);
        assert!((impurity(&[2, 2], 4, false) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn impurity_gate_blocks_weak_splits() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let data = tiny_dataset(dir.path(), 1, &s1_samples())?;
        let layout = NodeLayout::calculate(2, 2, 64, 1);

        let mut p = params(2);
        p.impurity_threshold = 0.9;

        let mut tree = Tree::new(0);
        tree.build(&data, &(0..8).collect::<Vec<_>>(), &p, &layout)?;

        // Best possible Gini gain here is 0.5, below the gate
        assert_eq!(1, tree.count_nodes());

        Ok(())
    }
}
