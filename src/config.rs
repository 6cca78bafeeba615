// Copyright (c) 2024-present, microforest-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{base::Base, file::rewrite_atomic, metrics::metric, Error, Label};
use byteorder::{LittleEndian, ReadBytesExt};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};

/// Strategy used to produce the scalar model quality during training.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum TrainingScore {
    /// Out-of-bag: each sample scored by trees that never saw it
    #[default]
    Oob,

    /// Held-out validation fraction
    Valid,

    /// K disjoint folds
    KFold,
}

impl TrainingScore {
    fn parse(s: &str) -> Self {
        match s {
            "valid_score" => Self::Valid,
            "k_fold_score" => Self::KFold,
            _ => Self::Oob,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Oob => "oob_score",
            Self::Valid => "valid_score",
            Self::KFold => "k_fold_score",
        }
    }
}

fn parse_metric(s: &str) -> u8 {
    match s {
        "PRECISION" => metric::PRECISION,
        "RECALL" => metric::RECALL,
        "F1_SCORE" => metric::F1_SCORE,
        _ => metric::ACCURACY,
    }
}

fn metric_name(mask: u8) -> &'static str {
    match mask {
        metric::PRECISION => "PRECISION",
        metric::RECALL => "RECALL",
        metric::F1_SCORE => "F1_SCORE",
        _ => "ACCURACY",
    }
}

/// The declared JSON configuration schema.
///
/// Unknown fields are ignored, missing fields keep defaults (malformed
/// input is skipped, not fatal).
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct ConfigFile {
    #[serde(rename = "numTrees")]
    num_trees: Option<u8>,
    #[serde(rename = "randomSeed")]
    random_seed: Option<u64>,
    train_ratio: Option<f32>,
    test_ratio: Option<f32>,
    valid_ratio: Option<f32>,
    #[serde(rename = "minSplit")]
    min_split: Option<u8>,
    #[serde(rename = "minLeaf")]
    min_leaf: Option<u8>,
    #[serde(rename = "maxDepth")]
    max_depth: Option<u16>,
    #[serde(rename = "useBootstrap")]
    use_bootstrap: Option<bool>,
    #[serde(rename = "boostrapRatio")]
    bootstrap_ratio: Option<f32>,
    criterion: Option<String>,
    #[serde(rename = "trainingScore")]
    training_score: Option<String>,
    k_folds: Option<u8>,
    #[serde(rename = "impurityThreshold")]
    impurity_threshold: Option<f32>,
    metric_score: Option<String>,
    #[serde(rename = "resultScore")]
    result_score: Option<f32>,
    threshold_bits: Option<u8>,
    feature_bits: Option<u8>,
    label_bits: Option<u8>,
    child_bits: Option<u8>,
    #[serde(rename = "enableRetrain")]
    enable_retrain: Option<bool>,
    #[serde(rename = "enableAutoConfig")]
    enable_auto_config: Option<bool>,
    max_samples: Option<u32>,
    #[serde(rename = "Estimated RAM (bytes)")]
    estimated_ram: Option<u32>,
}

/// Typed model configuration merged from the dataset summary and the JSON
/// config file.
#[derive(Clone, Debug)]
pub struct Config {
    // Core model configuration
    pub num_trees: u8,
    pub random_seed: u64,
    pub min_split: u8,
    pub min_leaf: u8,
    pub max_depth: u16,
    pub use_bootstrap: bool,
    pub bootstrap_ratio: f32,
    pub use_gini: bool,
    pub k_folds: u8,
    pub impurity_threshold: f32,
    pub train_ratio: f32,
    pub test_ratio: f32,
    pub valid_ratio: f32,
    pub training_score: TrainingScore,
    pub metric_mask: u8,
    pub result_score: f32,
    pub estimated_ram: u32,
    pub enable_retrain: bool,
    pub enable_auto_config: bool,

    // Dataset parameters
    pub num_samples: u32,
    pub max_samples: u32,
    pub num_features: u16,
    pub num_labels: Label,
    pub quantization_coefficient: u8,
    pub lowest_distribution: f32,
    pub samples_per_label: Vec<u32>,

    // Node layout bit widths (0 = derive at train time)
    pub threshold_bits: u8,
    pub feature_bits: u8,
    pub label_bits: u8,
    pub child_bits: u8,

    // Derived parameter ranges
    pub min_split_range: (u8, u8),
    pub min_leaf_range: (u8, u8),
    pub max_depth_range: (u16, u16),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_trees: 20,
            random_seed: 37,
            min_split: 2,
            min_leaf: 1,
            max_depth: 250,
            use_bootstrap: true,
            bootstrap_ratio: 0.632,
            use_gini: false,
            k_folds: 4,
            impurity_threshold: 0.0,
            train_ratio: 0.8,
            test_ratio: 0.0,
            valid_ratio: 0.0,
            training_score: TrainingScore::Oob,
            metric_mask: metric::ACCURACY,
            result_score: 0.0,
            estimated_ram: 0,
            enable_retrain: true,
            enable_auto_config: false,
            num_samples: 0,
            max_samples: 0,
            num_features: 0,
            num_labels: 0,
            quantization_coefficient: 2,
            lowest_distribution: 100.0,
            samples_per_label: Vec::new(),
            threshold_bits: 0,
            feature_bits: 0,
            label_bits: 0,
            child_bits: 0,
            min_split_range: (2, 6),
            min_leaf_range: (1, 4),
            max_depth_range: (4, 16),
        }
    }
}

impl Config {
    /// Loads the configuration for a model.
    ///
    /// The dataset summary comes from the dp file, falling back to a full
    /// scan of the binary base data. The JSON config is merged on top; when
    /// auto-config is enabled (explicitly or because no config file exists),
    /// hyperparameters are derived from the dataset shape.
    pub fn load(base: &Base) -> crate::Result<Self> {
        let mut config = Self::default();

        let dp_ok = if base.dp_file_exists() {
            match config.load_dp_file(base) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("cannot load dataset parameters ({e}), scanning base data");
                    config.scan_base_data(base).is_ok()
                }
            }
        } else {
            config.scan_base_data(base).is_ok()
        };

        if !dp_ok {
            return Err(Error::Incompatible("no dataset parameters available"));
        }

        config.recompute_lowest_distribution();

        if base.config_file_exists() {
            let text = std::fs::read_to_string(base.config_path())?;
            match serde_json::from_str::<ConfigFile>(&text) {
                Ok(file) => {
                    config.merge_file(&file);
                    config.validate_ratios();
                    config.generate_ranges(false);
                }
                Err(e) => {
                    log::warn!("failed to parse config file: {e}");
                    config.enable_auto_config = true;
                }
            }
        } else {
            config.enable_auto_config = true;
        }

        if config.enable_auto_config {
            log::debug!("auto-config enabled, deriving settings from dataset parameters");
            config.auto_config();
        }

        Ok(config)
    }

    fn merge_file(&mut self, file: &ConfigFile) {
        if let Some(v) = file.num_trees {
            self.num_trees = v;
        }
        if let Some(v) = file.random_seed {
            self.random_seed = v;
        }
        if let Some(v) = file.min_split {
            self.min_split = v;
        }
        if let Some(v) = file.min_leaf {
            self.min_leaf = v.max(1);
        }
        if let Some(v) = file.max_depth {
            self.max_depth = v;
        }
        if let Some(v) = file.use_bootstrap {
            self.use_bootstrap = v;
        }
        if let Some(v) = file.bootstrap_ratio {
            self.bootstrap_ratio = v;
        }
        if let Some(v) = &file.criterion {
            self.use_gini = v == "gini";
        }
        if let Some(v) = file.k_folds {
            self.k_folds = v.max(2);
        }
        if let Some(v) = file.impurity_threshold {
            self.impurity_threshold = v;
        }
        if let Some(v) = file.train_ratio {
            self.train_ratio = v;
        }
        if let Some(v) = file.test_ratio {
            self.test_ratio = v;
        }
        if let Some(v) = file.valid_ratio {
            self.valid_ratio = v;
        }
        if let Some(v) = &file.training_score {
            self.training_score = TrainingScore::parse(v);
        }
        if let Some(v) = &file.metric_score {
            self.metric_mask = parse_metric(v);
        }
        if let Some(v) = file.result_score {
            self.result_score = v;
        }
        if let Some(v) = file.estimated_ram {
            self.estimated_ram = v;
        }
        if let Some(v) = file.enable_retrain {
            self.enable_retrain = v;
        }
        if let Some(v) = file.enable_auto_config {
            self.enable_auto_config = v;
        }
        if let Some(v) = file.max_samples {
            self.max_samples = v;
        }
        if let Some(v) = file.threshold_bits {
            self.threshold_bits = v;
        }
        if let Some(v) = file.feature_bits {
            self.feature_bits = v;
        }
        if let Some(v) = file.label_bits {
            self.label_bits = v;
        }
        if let Some(v) = file.child_bits {
            self.child_bits = v;
        }

        // Decision-tree mode: a single tree cannot be bagged or OOB-scored
        if self.num_trees == 1 {
            self.use_bootstrap = false;
            self.bootstrap_ratio = 1.0;
            if self.training_score == TrainingScore::Oob {
                self.training_score = TrainingScore::Valid;
            }
        }
    }

    /// Writes the configuration back to its JSON file and rewrites the dp
    /// summary CSV.
    pub fn save(&self, base: &mut Base) -> crate::Result<()> {
        let file = ConfigFile {
            num_trees: Some(self.num_trees),
            random_seed: Some(self.random_seed),
            train_ratio: Some(self.train_ratio),
            test_ratio: Some(self.test_ratio),
            valid_ratio: Some(self.valid_ratio),
            min_split: Some(self.min_split),
            min_leaf: Some(self.min_leaf),
            max_depth: Some(self.max_depth),
            use_bootstrap: Some(self.use_bootstrap),
            bootstrap_ratio: Some(self.bootstrap_ratio),
            criterion: Some(if self.use_gini { "gini" } else { "entropy" }.to_owned()),
            training_score: Some(self.training_score.as_str().to_owned()),
            k_folds: Some(self.k_folds),
            impurity_threshold: Some(self.impurity_threshold),
            metric_score: Some(metric_name(self.metric_mask).to_owned()),
            result_score: Some(self.result_score),
            threshold_bits: Some(self.threshold_bits),
            feature_bits: Some(self.feature_bits),
            label_bits: Some(self.label_bits),
            child_bits: Some(self.child_bits),
            enable_retrain: Some(self.enable_retrain),
            enable_auto_config: Some(self.enable_auto_config),
            max_samples: Some(self.max_samples),
            estimated_ram: Some(self.estimated_ram),
        };

        let json = serde_json::to_string_pretty(&file).map_err(std::io::Error::other)?;
        rewrite_atomic(&base.config_path(), json.as_bytes())?;
        base.set_config_status(true);

        self.save_dp_file(base)?;

        log::debug!("configuration saved to {:?}", base.config_path());
        Ok(())
    }

    /// Scans the binary base data for sample/feature/label statistics.
    fn scan_base_data(&mut self, base: &Base) -> crate::Result<()> {
        let path = base.base_data_path();
        log::debug!("scanning base data: {path:?}");

        let mut file = std::fs::File::open(&path)?;
        let num_samples = file.read_u32::<LittleEndian>()?;
        let num_features = file.read_u16::<LittleEndian>()?;

        let packed_bytes = (u64::from(num_features) * u64::from(self.quantization_coefficient))
            .div_ceil(8);

        let mut label_counts: FxHashMap<Label, u32> = FxHashMap::default();
        let mut max_label: Label = 0;

        for _ in 0..num_samples {
            let mut label = [0u8; 1];
            file.read_exact(&mut label)?;
            let label = label[0];

            *label_counts.entry(label).or_insert(0) += 1;
            if label > max_label {
                max_label = label;
            }
            file.seek(SeekFrom::Current(packed_bytes as i64))?;
        }

        self.num_samples = num_samples;
        self.num_features = num_features;
        #[allow(clippy::cast_possible_truncation)]
        {
            self.num_labels = label_counts.len() as Label;
        }

        self.samples_per_label = vec![0; usize::from(max_label) + 1];
        for (label, count) in label_counts {
            self.samples_per_label[usize::from(label)] = count;
        }

        log::debug!(
            "base data scan complete: {} samples, {} features, {} labels",
            self.num_samples,
            self.num_features,
            self.num_labels
        );
        Ok(())
    }

    /// Reads the dataset-parameters CSV (`parameter,value` pairs).
    fn load_dp_file(&mut self, base: &Base) -> crate::Result<()> {
        let file = std::fs::File::open(base.dp_path())?;
        let reader = BufReader::new(file);

        let mut label_counts: FxHashMap<Label, u32> = FxHashMap::default();

        for line in reader.lines().skip(1) {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((parameter, value)) = line.split_once(',') else {
                continue;
            };
            let parameter = parameter.trim();
            let value = value.trim();

            match parameter {
                "num_features" => self.num_features = value.parse().unwrap_or(0),
                "num_samples" => self.num_samples = value.parse().unwrap_or(0),
                "num_labels" => self.num_labels = value.parse().unwrap_or(0),
                "quantization_coefficient" => {
                    self.quantization_coefficient = value.parse().unwrap_or(2);
                }
                _ => {
                    if let Some(index) = parameter.strip_prefix("samples_label_") {
                        if let (Ok(label), Ok(count)) =
                            (index.parse::<Label>(), value.parse::<u32>())
                        {
                            label_counts.insert(label, count);
                        }
                    }
                }
            }
        }

        if self.num_features == 0 || self.num_samples == 0 || self.num_labels == 0 {
            return Err(Error::Incompatible("invalid dataset parameters in dp file"));
        }

        self.samples_per_label = vec![0; usize::from(self.num_labels)];
        for (label, count) in label_counts {
            if usize::from(label) < self.samples_per_label.len() {
                self.samples_per_label[usize::from(label)] = count;
            }
        }

        Ok(())
    }

    /// Rewrites the dp summary CSV with the current per-label counts.
    fn save_dp_file(&self, base: &mut Base) -> crate::Result<()> {
        let mut out = Vec::new();
        writeln!(out, "parameter,value")?;
        writeln!(out, "quantization_coefficient,{}", self.quantization_coefficient)?;

        let max_value: u32 = (1u32 << self.quantization_coefficient) - 1;
        let features_per_byte = 8 / self.quantization_coefficient.max(1);
        writeln!(out, "max_feature_value,{max_value}")?;
        writeln!(out, "features_per_byte,{features_per_byte}")?;

        writeln!(out, "num_features,{}", self.num_features)?;
        writeln!(out, "num_samples,{}", self.num_samples)?;
        writeln!(out, "num_labels,{}", self.num_labels)?;

        for (label, count) in self.samples_per_label.iter().enumerate() {
            writeln!(out, "samples_label_{label},{count}")?;
        }

        rewrite_atomic(&base.dp_path(), &out)?;
        base.set_dp_status(true);
        Ok(())
    }

    fn recompute_lowest_distribution(&mut self) {
        self.lowest_distribution = 100.0;
        if self.num_samples == 0 {
            return;
        }
        for count in &self.samples_per_label {
            if *count > 0 {
                #[allow(clippy::cast_precision_loss)]
                let pct = 100.0 * *count as f32 / self.num_samples as f32;
                if pct < self.lowest_distribution {
                    self.lowest_distribution = pct;
                }
            }
        }
    }

    fn validate_ratios(&mut self) {
        for ratio in [
            &mut self.train_ratio,
            &mut self.test_ratio,
            &mut self.valid_ratio,
        ] {
            if !(0.0..=1.0).contains(ratio) {
                *ratio = 0.0;
            }
        }
        if self.train_ratio <= 0.0 {
            self.train_ratio = 0.8;
        }

        let sum = self.train_ratio + self.test_ratio + self.valid_ratio;
        if sum > 1.0 {
            self.train_ratio /= sum;
            self.test_ratio /= sum;
            self.valid_ratio /= sum;
        }

        if self.training_score == TrainingScore::Valid && self.valid_ratio <= 0.0 {
            self.valid_ratio = (1.0 - self.train_ratio).clamp(0.1, 0.3);
        }
        if self.bootstrap_ratio <= 0.0 || self.bootstrap_ratio > 1.0 {
            self.bootstrap_ratio = 0.632;
        }
    }

    /// Derives `min_split`/`min_leaf`/`max_depth` ranges from the dataset
    /// shape; with `force`, the point values are reset into those ranges.
    fn generate_ranges(&mut self, force: bool) {
        #[allow(clippy::cast_precision_loss)]
        let num_samples = (self.num_samples.max(2)) as f32;
        #[allow(clippy::cast_precision_loss)]
        let num_features = (self.num_features.max(1)) as f32;

        let min_min_split = 2u8;
        let dynamic_max = (f32::from(min_min_split) + 6.0)
            .min(num_samples.log2() / 4.0 + num_features / 25.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let mut max_min_split = (dynamic_max as u8).min(16);
        if max_min_split <= min_min_split {
            max_min_split = min_min_split + 4;
        }

        let samples_per_label = if self.num_labels > 0 {
            num_samples / f32::from(u16::from(self.num_labels))
        } else {
            num_samples
        };
        let density_factor = (samples_per_label / 600.0).clamp(0.3, 3.0);

        let expected_min_pct = if self.num_labels > 0 {
            100.0 / f32::from(u16::from(self.num_labels))
        } else {
            100.0
        };
        let deficit_pct = (expected_min_pct - self.lowest_distribution).max(0.0);
        let imbalance_ratio = if expected_min_pct > 0.0 {
            (deficit_pct / expected_min_pct).min(0.5)
        } else {
            0.0
        };
        let imbalance_factor = 1.0 - imbalance_ratio;

        let min_ratio = (0.12 + 0.05 * density_factor * imbalance_factor).clamp(0.1, 0.35);
        let mut max_ratio = min_ratio + 0.12 + 0.04 * density_factor;
        max_ratio = max_ratio.max(min_ratio + 0.1).min(0.6);

        let max_cap = max_min_split.saturating_sub(1).max(1);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let min_min_leaf = ((f32::from(min_min_split) * min_ratio).floor() as u8)
            .max(1)
            .min(max_cap);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let max_min_leaf = ((f32::from(max_min_split) * max_ratio).ceil() as u8)
            .min(max_cap)
            .max(min_min_leaf);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let base_max_depth = (num_samples.log2() + num_features.log2()) as u16 + 1;
        let max_max_depth = base_max_depth.max(8);
        let min_max_depth = if max_max_depth > 18 {
            max_max_depth - 6
        } else if max_max_depth > 12 {
            max_max_depth - 4
        } else if max_max_depth > 8 {
            max_max_depth - 2
        } else {
            4
        };

        if self.min_split == 0 || force {
            self.min_split = min_min_split;
        }
        if self.min_leaf == 0 || force {
            self.min_leaf = min_min_leaf;
        }
        if self.max_depth == 0 || force {
            self.max_depth = max_max_depth;
        }

        self.min_split_range = (min_min_split, max_min_split);
        self.min_leaf_range = (min_min_leaf, max_min_leaf);
        self.max_depth_range = (min_max_depth, max_max_depth);

        log::debug!(
            "parameter ranges: split {:?}, leaf {:?}, depth {:?}",
            self.min_split_range,
            self.min_leaf_range,
            self.max_depth_range
        );
    }

    fn generate_impurity_threshold(&mut self) {
        if self.samples_per_label.is_empty() {
            self.impurity_threshold = 0.0;
            return;
        }

        let k = f32::from(u16::from(self.num_labels)).max(2.0);
        let expected_min_pct = 100.0 / k;
        let deficit = (expected_min_pct - self.lowest_distribution).max(0.0);
        let imbalance = if expected_min_pct > 0.0 {
            (deficit / expected_min_pct).min(1.0)
        } else {
            0.0
        };

        #[allow(clippy::cast_precision_loss)]
        let log_samples = (self.num_samples.max(2) as f32).log2();
        let adjusted = (log_samples - 10.0).max(0.0);
        let sample_factor = (1.0 / (1.0 + adjusted / 2.5)).clamp(0.25, 1.15);
        // Rare classes need weak splits allowed; many features demand more gain
        let imbalance_factor = 1.0 - 0.5 * imbalance;
        let feature_factor = 0.9
            + 0.1 * (f32::from(self.num_features.max(2)).log2() / 8.0).min(1.0);

        self.impurity_threshold = if self.use_gini {
            let max_gini = 1.0 - 1.0 / k;
            (0.003 * max_gini * sample_factor * imbalance_factor * feature_factor)
                .clamp(0.0003, 0.02)
        } else {
            let max_entropy = k.log2().max(1.0);
            (0.02 * max_entropy * sample_factor * imbalance_factor * feature_factor)
                .clamp(0.002, 0.2)
        };

        log::debug!("impurity threshold set to {}", self.impurity_threshold);
    }

    /// Derives every tunable from the dataset shape.
    fn auto_config(&mut self) {
        if !self.samples_per_label.is_empty() && self.lowest_distribution > 0.0 {
            let imbalance = 1.0 / self.lowest_distribution * 100.0;
            self.metric_mask = if imbalance > 10.0 {
                log::debug!("highly imbalanced dataset ({imbalance:.1}x), scoring by recall");
                metric::RECALL
            } else if imbalance > 3.0 {
                metric::F1_SCORE
            } else if imbalance > 1.5 {
                metric::PRECISION
            } else {
                metric::ACCURACY
            };
        }

        let avg_samples_per_label =
            self.num_samples / u32::from(u16::from(self.num_labels)).max(1);
        self.training_score = if avg_samples_per_label < 200 {
            TrainingScore::KFold
        } else if avg_samples_per_label < 500 {
            TrainingScore::Oob
        } else {
            TrainingScore::Valid
        };

        self.validate_ratios();
        self.generate_ranges(true);
        self.generate_impurity_threshold();
    }
}
