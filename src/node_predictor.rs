// Copyright (c) 2024-present, microforest-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{base::Base, config::Config, file::rewrite_atomic, MAX_NODES};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    io::{BufRead, BufReader, Read, Write},
    path::PathBuf,
};

pub const MAGIC_BYTES: [u8; 4] = [b'N', b'O', b'D', b'E'];

const LOG_HEADER: &str = "min_split,min_leaf,max_depth,total_nodes";

/// Rows kept in the rolling observation log
const LOG_CAPACITY: usize = 50;

/// Unflushed observations held in RAM
const BUFFER_CAPACITY: usize = 12;

/// One (hyperparameters, observed node count) pair.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct Observation {
    min_split: u8,
    min_leaf: u8,
    max_depth: u16,
    total_nodes: u32,
}

/// Linear estimator for per-tree node counts.
///
/// Sizes the pre-allocated build storage and the BFS frontier before each
/// build so training does not reallocate or abort out of memory. Retrained
/// from a rolling CSV log of observed builds; falls back to a shape-derived
/// heuristic until enough observations exist.
#[derive(Debug)]
pub struct NodePredictor {
    predictor_path: PathBuf,
    log_path: PathBuf,

    /// bias, min_split, min_leaf, max_depth coefficients
    coefficients: [f32; 4],
    trained: bool,
    accuracy: u8,
    peak_percent: u8,
    trained_sample_count: u32,

    buffer: Vec<Observation>,
    drift_warned: bool,
}

impl NodePredictor {
    /// Creates a predictor bound to a model's files.
    ///
    /// The observation log is created with its header when missing.
    #[must_use]
    pub fn new(base: &Base) -> Self {
        let predictor = Self {
            predictor_path: base.node_predictor_path(),
            log_path: base.node_log_path(),
            coefficients: [0.0; 4],
            trained: false,
            accuracy: 0,
            peak_percent: 0,
            trained_sample_count: 0,
            buffer: Vec::new(),
            drift_warned: false,
        };

        if !predictor.log_path.exists() {
            if let Err(e) = std::fs::write(&predictor.log_path, format!("{LOG_HEADER}\n")) {
                log::warn!("failed to create node predictor log: {e}");
            }
        }

        predictor
    }

    #[must_use]
    pub fn is_trained(&self) -> bool {
        self.trained
    }

    #[must_use]
    pub fn accuracy(&self) -> u8 {
        self.accuracy
    }

    /// Loads persisted coefficients; `Ok(false)` when no usable file exists.
    pub fn load(&mut self) -> crate::Result<bool> {
        if self.trained {
            return Ok(true);
        }
        if !self.predictor_path.exists() {
            log::debug!("no predictor file found, using default estimator");
            return Ok(false);
        }

        let mut file = std::fs::File::open(&self.predictor_path)?;

        let mut magic = [0u8; MAGIC_BYTES.len()];
        file.read_exact(&mut magic)?;
        if magic != MAGIC_BYTES {
            return Err(crate::coding::DecodeError::InvalidHeader("NodePredictor").into());
        }

        let file_trained = file.read_u8()? != 0;
        self.accuracy = file.read_u8()?;
        self.peak_percent = file.read_u8()?;

        let coefficient_count = file.read_u8()?;
        if coefficient_count != 4 {
            return Err(
                crate::coding::DecodeError::InvalidTag(("CoefficientCount", coefficient_count))
                    .into(),
            );
        }
        for slot in &mut self.coefficients {
            *slot = file.read_f32::<LittleEndian>()?;
        }
        self.trained_sample_count = file.read_u32::<LittleEndian>()?;

        self.drift_warned = false;
        if file_trained {
            self.trained = true;
            if self.peak_percent == 0 {
                self.peak_percent = 30;
            }
            log::debug!("node predictor loaded: {:?}", self.predictor_path);
        } else {
            log::debug!("predictor file exists but is untrained");
        }
        Ok(file_trained)
    }

    /// Persists the trained coefficients atomically.
    pub fn save(&self) -> crate::Result<()> {
        if !self.trained {
            return Err(crate::Error::Incompatible("predictor is not trained"));
        }

        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC_BYTES);
        buf.write_u8(u8::from(self.trained))?;
        buf.write_u8(self.accuracy)?;
        buf.write_u8(self.peak_percent)?;
        buf.write_u8(4)?;
        for c in &self.coefficients {
            buf.write_f32::<LittleEndian>(*c)?;
        }
        buf.write_u32::<LittleEndian>(self.trained_sample_count)?;

        rewrite_atomic(&self.predictor_path, &buf)?;
        log::debug!("node predictor saved: {:?}", self.predictor_path);
        Ok(())
    }

    /// Records one observed build; flushes to the log when the RAM buffer
    /// fills up.
    pub fn observe(&mut self, min_split: u8, min_leaf: u8, max_depth: u16, total_nodes: u32) {
        if min_split == 0 || min_leaf == 0 {
            return;
        }
        self.buffer.push(Observation {
            min_split,
            min_leaf,
            max_depth,
            total_nodes,
        });

        if self.buffer.len() >= BUFFER_CAPACITY {
            if let Err(e) = self.flush_buffer() {
                log::warn!("failed to flush node predictor buffer: {e}");
            }
        }
    }

    /// Prepends buffered observations to the log, newest first, keeping at
    /// most [`LOG_CAPACITY`] rows.
    pub fn flush_buffer(&mut self) -> crate::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let mut rows: Vec<String> = Vec::new();
        for obs in self.buffer.iter().rev() {
            rows.push(format!(
                "{},{},{},{}",
                obs.min_split, obs.min_leaf, obs.max_depth, obs.total_nodes
            ));
        }

        if let Ok(file) = std::fs::File::open(&self.log_path) {
            for line in BufReader::new(file).lines() {
                let line = line?;
                let line = line.trim();
                // Keep only data rows; legacy headers are dropped
                if line.is_empty() || !line.starts_with(|c: char| c.is_ascii_digit()) {
                    continue;
                }
                rows.push(line.to_owned());
            }
        }
        rows.truncate(LOG_CAPACITY);

        let mut out = Vec::new();
        writeln!(out, "{LOG_HEADER}")?;
        for row in &rows {
            writeln!(out, "{row}")?;
        }
        rewrite_atomic(&self.log_path, &out)?;

        self.buffer.clear();
        Ok(())
    }

    fn read_log(&self) -> crate::Result<Vec<Observation>> {
        let file = std::fs::File::open(&self.log_path)?;
        let mut observations = Vec::new();

        for line in BufReader::new(file).lines().skip(1) {
            let line = line?;
            let fields: Vec<&str> = line.trim().split(',').collect();
            if fields.len() != 4 {
                continue;
            }
            let (Ok(min_split), Ok(min_leaf), Ok(max_depth), Ok(total_nodes)) = (
                fields[0].parse::<u8>(),
                fields[1].parse::<u8>(),
                fields[2].parse::<u16>(),
                fields[3].parse::<u32>(),
            ) else {
                continue;
            };

            if min_split > 0 && min_leaf > 0 && max_depth > 0 && total_nodes > 0 {
                observations.push(Observation {
                    min_split,
                    min_leaf,
                    max_depth,
                    total_nodes,
                });
            }
        }
        Ok(observations)
    }

    /// Returns `true` when the log holds enough observations to retrain.
    #[must_use]
    pub fn can_retrain(&self) -> bool {
        self.read_log().map(|rows| rows.len() >= 3).unwrap_or(false)
    }

    /// Refits the linear model from the observation log.
    ///
    /// Effects are estimated from the endpoint means of the observed
    /// `min_split` and `min_leaf` values; the depth coefficient stays 0 but
    /// is reserved in the file schema. Accuracy is `100 - MAPE`.
    pub fn retrain(&mut self, num_samples: u32, save_after: bool) -> crate::Result<bool> {
        self.flush_buffer()?;

        let data = self.read_log()?;
        if data.len() < 3 {
            log::debug!("not enough observations to retrain ({} rows)", data.len());
            return Ok(false);
        }

        let mut splits: Vec<u8> = data.iter().map(|o| o.min_split).collect();
        splits.sort_unstable();
        splits.dedup();
        let mut leaves: Vec<u8> = data.iter().map(|o| o.min_leaf).collect();
        leaves.sort_unstable();
        leaves.dedup();

        let endpoint_effect = |lo: u8, hi: u8, key: fn(&Observation) -> u8| -> f32 {
            if lo == hi {
                return 0.0;
            }
            let mean_at = |v: u8| -> Option<f32> {
                let matching: Vec<f32> = data
                    .iter()
                    .filter(|o| key(o) == v)
                    .map(|o| {
                        #[allow(clippy::cast_precision_loss)]
                        {
                            o.total_nodes as f32
                        }
                    })
                    .collect();
                if matching.is_empty() {
                    None
                } else {
                    #[allow(clippy::cast_precision_loss)]
                    Some(matching.iter().sum::<f32>() / matching.len() as f32)
                }
            };
            match (mean_at(lo), mean_at(hi)) {
                (Some(lo_mean), Some(hi_mean)) => {
                    (hi_mean - lo_mean) / f32::from(hi - lo)
                }
                _ => 0.0,
            }
        };

        let split_effect = endpoint_effect(
            *splits.first().expect("non-empty"),
            *splits.last().expect("non-empty"),
            |o| o.min_split,
        );
        let leaf_effect = endpoint_effect(
            *leaves.first().expect("non-empty"),
            *leaves.last().expect("non-empty"),
            |o| o.min_leaf,
        );

        #[allow(clippy::cast_precision_loss)]
        let overall_mean =
            data.iter().map(|o| o.total_nodes as f32).sum::<f32>() / data.len() as f32;

        let reference_split = f32::from(*splits.first().expect("non-empty"));
        let reference_leaf = f32::from(*leaves.first().expect("non-empty"));

        self.coefficients[0] =
            overall_mean - split_effect * reference_split - leaf_effect * reference_leaf;
        self.coefficients[1] = split_effect;
        self.coefficients[2] = leaf_effect;
        self.coefficients[3] = 0.0;

        // Accuracy from mean absolute percentage error over the log
        let mut total_error = 0.0f32;
        let mut total_actual = 0.0f32;
        for obs in &data {
            let predicted = self.evaluate_formula(obs.min_split, obs.min_leaf, obs.max_depth);
            #[allow(clippy::cast_precision_loss)]
            let actual = obs.total_nodes as f32;
            total_error += (predicted - actual).abs();
            total_actual += actual;
        }
        let mape = if total_actual > 0.0 {
            total_error / total_actual * 100.0
        } else {
            100.0
        };
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            self.accuracy = (100.0 - mape).clamp(0.0, 100.0) as u8;
        }

        self.peak_percent = 30;
        self.trained = true;
        self.trained_sample_count = num_samples;
        self.drift_warned = false;

        log::debug!(
            "node predictor retrained: accuracy {}%, bias {:.1}",
            self.accuracy,
            self.coefficients[0]
        );

        if save_after {
            self.save()?;
        }
        Ok(true)
    }

    fn evaluate_formula(&self, min_split: u8, min_leaf: u8, max_depth: u16) -> f32 {
        let result = self.coefficients[0]
            + self.coefficients[1] * f32::from(min_split)
            + self.coefficients[2] * f32::from(min_leaf)
            + self.coefficients[3] * f32::from(max_depth);
        result.max(10.0)
    }

    /// Shape-derived heuristic used until the model is trained.
    fn manual_estimate(&self, config: &Config) -> f32 {
        if config.min_split == 0 {
            return 100.0;
        }

        let safe_leaf = f32::from(config.min_leaf.max(1));
        let leaf_adjustment = 60.0 / safe_leaf;
        let depth_factor = f32::from(config.max_depth.min(250)) / 50.0;

        #[allow(clippy::cast_precision_loss)]
        let sample_factor = if config.num_samples > 100 {
            (1.0 + 0.5 * (config.num_samples as f32 / 100.0).log2()).min(2.5)
        } else {
            1.0
        };
        let feature_factor = if config.num_features > 10 {
            (1.0 + 0.3 * (f32::from(config.num_features) / 10.0).log2()).min(2.0)
        } else {
            1.0
        };
        let label_factor = if config.num_labels > 2 {
            (0.8 + 0.2 * f32::from(u16::from(config.num_labels)) / 10.0).min(1.5)
        } else {
            1.0
        };

        let estimate = (120.0 - f32::from(config.min_split) * 10.0
            + leaf_adjustment
            + depth_factor * 15.0)
            * sample_factor
            * feature_factor
            * label_factor;
        estimate.max(10.0)
    }

    fn raw_estimate(&mut self, config: &Config) -> f32 {
        if !self.trained && !self.load().unwrap_or(false) {
            return self.manual_estimate(config);
        }

        let mut prediction =
            self.evaluate_formula(config.min_split, config.min_leaf.max(1), config.max_depth);

        // Guard against a dataset that grew or shrank since training
        if self.trained_sample_count > 0 && config.num_samples > 0 {
            #[allow(clippy::cast_precision_loss)]
            let ratio = config.num_samples as f32 / self.trained_sample_count as f32;
            if !(0.5..=1.75).contains(&ratio) {
                if !self.drift_warned {
                    log::warn!(
                        "node predictor dataset drift: trained on {}, current {}; \
                         retrain to refresh coefficients",
                        self.trained_sample_count,
                        config.num_samples
                    );
                    self.drift_warned = true;
                }
                return self.manual_estimate(config);
            }
            if !(0.95..=1.05).contains(&ratio) {
                prediction *= ratio.clamp(0.75, 1.35);
            }
        }

        prediction
    }

    /// Estimated node count for the configured hyperparameters.
    ///
    /// Never returns 0 and never exceeds [`MAX_NODES`].
    pub fn estimate_nodes(&mut self, config: &Config) -> u32 {
        let raw = self.raw_estimate(config);
        let accuracy = f32::from(self.accuracy).max(90.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let estimate = (raw * 100.0 / accuracy).max(10.0) as u32;

        if estimate < MAX_NODES {
            estimate
        } else {
            let safe = if config.num_samples < 2_024 {
                512
            } else {
                (2 * config.num_samples / u32::from(config.min_leaf.max(1))).max(512)
            };
            safe.min(MAX_NODES)
        }
    }

    /// BFS frontier capacity for one build.
    ///
    /// Bounded below by 30 entries and above by 30% of the theoretical
    /// maximum node count for the dataset.
    pub fn queue_peak_size(&mut self, config: &Config) -> u32 {
        let mut estimate = self.estimate_nodes(config);

        if config.training_score == crate::config::TrainingScore::KFold {
            let k = u32::from(config.k_folds.max(2));
            estimate = estimate * k / (k + 1);
        }

        let peak = u32::from(if self.peak_percent == 0 {
            30
        } else {
            self.peak_percent
        });
        estimate = estimate * peak / 100;

        let theoretical =
            (2 * config.num_samples.max(1) / u32::from(config.min_leaf.max(1))).min(MAX_NODES);
        let upper = (theoretical * 3 / 10).max(30);

        estimate.clamp(30, upper)
    }
}
