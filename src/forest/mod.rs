// Copyright (c) 2024-present, microforest-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod scoring;

pub(crate) use scoring::majority_vote;

use crate::{
    base::Base,
    coding::DecodeError,
    config::{Config, TrainingScore},
    dataset::Dataset,
    file::rewrite_atomic,
    logger::MemoryProbe,
    node_predictor::NodePredictor,
    packed::PackedVector,
    rng::Rng,
    tree::{BuildParams, NodeLayout, Tree},
    Error, Label, MAX_TREES,
};
use byteorder::ReadBytesExt;
use std::io::Read;

pub const MAGIC_BYTES: [u8; 4] = [b'F', b'R', b'C', b'3'];

const FORMAT_VERSION: u8 = 3;

/// Extra headroom required on top of the estimated model RAM
const HEAP_PREFLIGHT_MARGIN: usize = 8_192;

/// Trains, scores, persists and serves an ensemble of trees.
///
/// The forest owns the shared [`NodeLayout`]; trees borrow it per call.
/// At most one tree's build storage is alive at a time during training;
/// each tree is converted to compact form and persisted before the next
/// build starts.
#[derive(Debug, Default)]
pub struct Forest {
    trees: Vec<Tree>,
    layout: Option<NodeLayout>,
    loaded: bool,
}

impl Forest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    #[must_use]
    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    #[must_use]
    pub fn layout(&self) -> Option<&NodeLayout> {
        self.layout.as_ref()
    }

    #[must_use]
    pub fn total_nodes(&self) -> usize {
        self.trees.iter().map(Tree::count_nodes).sum()
    }

    #[must_use]
    pub fn total_leaves(&self) -> usize {
        self.trees.iter().map(Tree::count_leaves).sum()
    }

    #[must_use]
    pub fn max_tree_depth(&self) -> u16 {
        self.trees.iter().map(Tree::depth).max().unwrap_or(0)
    }

    #[must_use]
    pub fn trees(&self) -> &[Tree] {
        &self.trees
    }

    /// Drops all trees and removes their files plus the unified file.
    pub fn clear(&mut self, base: &Base) -> crate::Result<()> {
        for tree in &mut self.trees {
            tree.clear();
            crate::file::remove_if_exists(&base.tree_path(tree.index()))?;
        }
        self.trees.clear();
        crate::file::remove_if_exists(&base.forest_path())?;
        self.loaded = false;
        Ok(())
    }

    /// Trains `config.num_trees` trees and returns the training score.
    ///
    /// Trees are trained and written in index order. Each tree gets its own
    /// RNG substream derived from the forest seed, so results are stable
    /// for a given (seed, dataset) pair. Per-tree files are written as each
    /// build finishes; call [`Forest::release`] afterwards for the unified
    /// form.
    pub fn train(
        &mut self,
        data: &mut Dataset,
        config: &mut Config,
        predictor: &mut NodePredictor,
        base: &Base,
    ) -> crate::Result<f32> {
        if config.num_trees == 0 || config.num_trees > MAX_TREES {
            return Err(Error::LimitExceeded("tree count out of range"));
        }
        if !data.is_loaded() {
            data.load(true)?;
        }
        let n = data.len();
        if n == 0 {
            return Err(Error::Incompatible("dataset is empty"));
        }

        let estimated_nodes = predictor.estimate_nodes(config);
        let queue_capacity = predictor.queue_peak_size(config) as usize;

        let layout = if config.threshold_bits > 0
            && config.feature_bits > 0
            && config.label_bits > 0
            && config.child_bits > 0
        {
            NodeLayout::from_bits(
                config.threshold_bits,
                config.feature_bits,
                config.label_bits,
                config.child_bits,
            )
        } else {
            NodeLayout::calculate(
                u16::from(config.num_labels),
                config.num_features,
                estimated_nodes,
                config.quantization_coefficient,
            )
        };
        config.threshold_bits = layout.threshold_bits;
        config.feature_bits = layout.feature_bits;
        config.label_bits = layout.label_bits;
        config.child_bits = layout.child_bits;
        self.layout = Some(layout);

        let rng = Rng::new(config.random_seed);

        // Sample partitioning per scoring mode
        #[allow(clippy::cast_possible_truncation)]
        let all_ids: Vec<u32> = (0..n as u32).collect();

        let (train_ids, valid_ids) = if config.training_score == TrainingScore::Valid {
            let mut shuffled = all_ids.clone();
            shuffle(&mut shuffled, &mut rng.derive(0, 0));
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let valid_n = ((n as f32 * config.valid_ratio) as usize).clamp(1, n.saturating_sub(1));
            let train: Vec<u32> = shuffled[..n - valid_n].to_vec();
            let valid: Vec<u32> = shuffled[n - valid_n..].to_vec();
            (train, valid)
        } else {
            (all_ids, Vec::new())
        };

        let k_folds = u32::from(config.k_folds.max(2));

        let params = BuildParams {
            min_split: usize::from(config.min_split.max(2)),
            min_leaf: usize::from(config.min_leaf.max(1)),
            max_depth: config.max_depth,
            use_gini: config.use_gini,
            impurity_threshold: config.impurity_threshold,
            num_labels: config.num_labels,
            reserve_nodes: estimated_nodes as usize,
            queue_capacity,
        };

        self.trees.clear();

        for index in 0..config.num_trees {
            let mut tree = Tree::new(index);
            let mut tree_rng = rng.derive(u64::from(index) + 1, 0);

            // K-fold trees never see their own fold
            let pool: Vec<u32> = if config.training_score == TrainingScore::KFold {
                let fold = u32::from(index) % k_folds;
                train_ids
                    .iter()
                    .copied()
                    .filter(|id| id % k_folds != fold)
                    .collect()
            } else {
                train_ids.clone()
            };
            if pool.is_empty() {
                return Err(Error::Incompatible("training pool is empty"));
            }

            let bag: Vec<u32> = if config.use_bootstrap {
                #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let m = ((pool.len() as f32 * config.bootstrap_ratio) as usize).max(1);
                #[allow(clippy::cast_possible_truncation)]
                (0..m)
                    .map(|_| pool[tree_rng.bounded(pool.len() as u32) as usize])
                    .collect()
            } else {
                pool.clone()
            };

            tree.build(data, &bag, &params, &layout)?;

            #[allow(clippy::cast_possible_truncation)]
            predictor.observe(
                config.min_split,
                config.min_leaf,
                config.max_depth,
                tree.count_nodes() as u32,
            );

            // Remember the bag (as a sorted set) for OOB membership tests
            let mut sorted_bag = bag;
            sorted_bag.sort_unstable();
            sorted_bag.dedup();
            tree.bootstrap = sorted_bag;

            if !tree.convert_to_compact(&layout) {
                return Err(Error::Incompatible("tree conversion failed"));
            }
            tree.save_to(&base.tree_path(index), &layout)?;

            log::debug!(
                "trained tree {index}: {} nodes, depth {}",
                tree.count_nodes(),
                tree.depth()
            );
            self.trees.push(tree);
        }

        self.loaded = true;

        let score = match config.training_score {
            TrainingScore::Oob => scoring::oob_score(&self.trees, data, config, &layout),
            TrainingScore::Valid => {
                scoring::holdout_score(&self.trees, data, &valid_ids, config, &layout)
            }
            TrainingScore::KFold => scoring::kfold_score(&self.trees, data, config, &layout),
        };
        config.result_score = score;

        predictor.flush_buffer()?;
        if config.enable_retrain && predictor.can_retrain() {
            predictor.retrain(config.num_samples, true)?;
        }

        log::debug!("forest trained: {} trees, score {score:.4}", self.trees.len());
        Ok(score)
    }

    /// Majority-vote inference over all loaded trees.
    ///
    /// Returns [`crate::ERROR_LABEL`](crate::ERROR_LABEL) when no tree
    /// produces a valid vote.
    #[must_use]
    pub fn predict_features(&self, features: &PackedVector, num_labels: Label) -> Label {
        let Some(layout) = &self.layout else {
            return crate::ERROR_LABEL;
        };
        if self.trees.is_empty() || !self.loaded {
            log::warn!("forest not loaded, cannot predict");
            return crate::ERROR_LABEL;
        }
        majority_vote(self.trees.iter(), features, num_labels, layout)
    }

    /// Writes every tree into the unified `FRC3` file and drops RAM.
    ///
    /// After the first release the forest is always in unified form.
    pub fn release(&mut self, base: &Base, probe: &dyn MemoryProbe) -> crate::Result<()> {
        if !self.loaded || self.trees.is_empty() {
            log::debug!("forest not loaded, nothing to release");
            return Ok(());
        }
        let Some(layout) = self.layout else {
            return Err(Error::Incompatible("forest has no layout"));
        };

        // Rough file-size estimate against free storage
        let total_nodes = self.total_nodes() as u64;
        let internal_bytes = u64::from(layout.internal_bits().div_ceil(8));
        let leaf_bytes = u64::from(layout.leaf_bits().div_ceil(8));
        let estimated_size = total_nodes / 2 * internal_bytes + total_nodes / 2 * leaf_bytes + 256;
        if probe.free_disk() < estimated_size {
            return Err(Error::InsufficientMemory {
                needed: estimated_size as usize,
                available: probe.free_disk() as usize,
            });
        }

        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC_BYTES);
        buf.push(FORMAT_VERSION);
        #[allow(clippy::cast_possible_truncation)]
        buf.push(self.trees.len() as u8);
        buf.push(layout.threshold_bits);
        buf.push(layout.feature_bits);
        buf.push(layout.label_bits);
        buf.push(layout.child_bits);

        for tree in &self.trees {
            buf.push(tree.index());
            tree.write_payload(&mut buf)?;
        }

        rewrite_atomic(&base.forest_path(), &buf)?;

        for tree in &mut self.trees {
            tree.clear();
        }
        self.loaded = false;

        log::debug!("released {} trees to {:?}", self.trees.len(), base.forest_path());
        Ok(())
    }

    /// Loads the forest, preferring the unified file over per-tree files.
    ///
    /// A heap preflight aborts early with a diagnostic instead of faulting
    /// mid-load on a constrained target.
    pub fn load(
        &mut self,
        base: &Base,
        config: &Config,
        probe: &dyn MemoryProbe,
    ) -> crate::Result<()> {
        if self.loaded {
            return Ok(());
        }

        let needed = config.estimated_ram as usize + HEAP_PREFLIGHT_MARGIN;
        let available = probe.free_heap();
        if available < needed {
            return Err(Error::InsufficientMemory { needed, available });
        }

        if base.forest_path().exists() {
            self.load_unified(base, config)
        } else {
            self.load_individual(base, config)
        }
    }

    fn load_unified(&mut self, base: &Base, config: &Config) -> crate::Result<()> {
        log::debug!("loading unified forest file {:?}", base.forest_path());
        let mut file = std::fs::File::open(base.forest_path())?;

        let mut magic = [0u8; MAGIC_BYTES.len()];
        file.read_exact(&mut magic)?;
        if magic != MAGIC_BYTES {
            return Err(DecodeError::InvalidHeader("Forest").into());
        }

        let version = file.read_u8()?;
        if version != FORMAT_VERSION {
            return Err(DecodeError::UnsupportedVersion(version).into());
        }

        let tree_count = file.read_u8()?;
        if tree_count != config.num_trees {
            log::warn!(
                "tree count mismatch in unified file: {tree_count}, expected {}",
                config.num_trees
            );
            return Err(Error::Incompatible("unified tree count mismatch"));
        }

        let threshold_bits = file.read_u8()?;
        let feature_bits = file.read_u8()?;
        let label_bits = file.read_u8()?;
        let child_bits = file.read_u8()?;
        self.layout = Some(NodeLayout::from_bits(
            threshold_bits,
            feature_bits,
            label_bits,
            child_bits,
        ));

        self.trees.clear();
        for _ in 0..tree_count {
            let result = file
                .read_u8()
                .map_err(crate::Error::from)
                .and_then(|index| {
                    let mut tree = Tree::new(index);
                    tree.read_payload(&mut file)?;
                    Ok(tree)
                });
            match result {
                Ok(tree) => self.trees.push(tree),
                Err(e) => {
                    self.trees.clear();
                    self.loaded = false;
                    return Err(e);
                }
            }
        }

        self.trees.sort_by_key(Tree::index);
        self.loaded = true;
        Ok(())
    }

    fn load_individual(&mut self, base: &Base, config: &Config) -> crate::Result<()> {
        log::debug!("loading individual tree files");

        let mut layout = self.layout.unwrap_or(NodeLayout::from_bits(
            config.threshold_bits.max(1),
            config.feature_bits.max(1),
            config.label_bits.max(1),
            config.child_bits.max(1),
        ));

        self.trees.clear();
        for index in 0..config.num_trees {
            let mut tree = Tree::new(index);
            match tree.load(&base.tree_path(index), &mut layout) {
                Ok(()) => self.trees.push(tree),
                Err(e) => {
                    log::warn!("failed to load tree {index}: {e}");
                    self.trees.clear();
                    self.loaded = false;
                    return Err(e);
                }
            }
        }

        self.layout = Some(layout);
        self.loaded = true;
        Ok(())
    }
}

/// Fisher-Yates shuffle driven by the engine RNG.
fn shuffle(ids: &mut [u32], rng: &mut Rng) {
    for i in (1..ids.len()).rev() {
        #[allow(clippy::cast_possible_truncation)]
        let j = rng.bounded(i as u32 + 1) as usize;
        ids.swap(i, j);
    }
}

/// Builds the packed feature vector of one stored sample.
pub(crate) fn packed_row(data: &Dataset, sample: usize) -> PackedVector {
    let mut row = PackedVector::with_bits(data.quantization_coefficient());
    for f in 0..data.total_features() {
        row.push(data.get_feature(sample, f));
    }
    row
}
