// Copyright (c) 2024-present, microforest-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A K.I.S.S. implementation of on-device random forests for
//! microcontroller-class targets.
//!
//! ##### About
//!
//! This crate trains and serves multi-class random-forest classifiers whose
//! feature values are pre-quantized to a few bits each, with the entire
//! model designed around tiny RAM budgets and small flash filesystems:
//!
//! - Training samples live in a chunked, bit-packed store
//!   ([`Dataset`]) that streams between flash and RAM and supports
//!   in-place bin remapping when quantizer boundaries move.
//! - The [`Quantizer`] maps raw float features to bins, detects
//!   concept drift at inference time and, on retrain, widens its ranges and
//!   emits a remap filter instead of re-quantizing raw data.
//! - Trees are built breadth-first and then packed into a compact
//!   three-vector form addressed by a rank-over-bitmap index
//!   ([`Tree`]).
//! - The [`Forest`] bootstraps, scores (OOB / holdout / k-fold) and
//!   serves majority-vote predictions, persisting either per-tree files or
//!   one unified model file.
//! - A small linear [`NodePredictor`] sizes node storage before each
//!   build so training never reallocates mid-flight.
//!
//! # Example
//!
//! ```no_run
//! use microforest::{Base, Config, Dataset, Forest, NodePredictor};
//!
//! # fn main() -> microforest::Result<()> {
//! let base = Base::new("/spiffs", "gesture")?;
//! let mut config = Config::load(&base)?;
//!
//! let mut data = Dataset::new(
//!     base.base_data_path(),
//!     config.quantization_coefficient,
//!     config.num_features,
//!     config.num_labels.into(),
//! )?;
//! data.load(true)?;
//!
//! let mut predictor = NodePredictor::new(&base);
//! let mut forest = Forest::new();
//! let score = forest.train(&mut data, &mut config, &mut predictor, &base)?;
//! println!("training score: {score:.3}");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(missing_docs)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::module_name_repetitions)]

mod base;

#[doc(hidden)]
pub mod coding;

mod config;
mod dataset;
mod error;

#[doc(hidden)]
pub mod file;

mod forest;
mod logger;
mod metrics;
mod node_predictor;

#[doc(hidden)]
pub mod packed;

mod quantizer;
mod rng;
mod tree;

/// Class label
pub type Label = u8;

/// Sentinel returned when no valid prediction exists (all-ones label)
pub const ERROR_LABEL: Label = Label::MAX;

/// Maximum number of unique labels supported
pub const MAX_LABELS: Label = 255;

/// Maximum label text length in bytes
pub const MAX_LABEL_LENGTH: u8 = 32;

/// Maximum number of features
pub const MAX_FEATURES: u16 = 1_023;

/// Maximum number of trees in a forest
pub const MAX_TREES: u8 = 100;

/// Maximum nodes per tree (18 bits)
pub const MAX_NODES: u32 = 262_144;

/// Maximum samples in a dataset (20 bits)
pub const MAX_SAMPLES: u32 = 1_048_576;

#[doc(hidden)]
pub use coding::{Decode, DecodeError, Encode, EncodeError};

pub use {
    base::Base,
    config::{Config, TrainingScore},
    dataset::{Dataset, Sample},
    error::{Error, Result},
    forest::Forest,
    logger::{EventLogger, HostProbe, MemoryProbe},
    metrics::{metric, MatrixScore},
    node_predictor::NodePredictor,
    packed::PackedVector,
    quantizer::{BinRemapFilter, DriftSample, FeatureKind, FeatureStats, Quantizer},
    rng::Rng,
    tree::{BuildParams, NodeLayout, Tree},
};
