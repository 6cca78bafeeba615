// Copyright (c) 2024-present, microforest-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod drift;
mod filter;

pub use filter::BinRemapFilter;

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    packed::PackedVector,
    Label, MAX_LABELS, MAX_LABEL_LENGTH,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

pub const MAGIC_BYTES: [u8; 4] = [b'Q', b'T', b'Z', b'4'];

/// Default z-score beyond which inputs are clamped to the observed spread
const OUTLIER_Z_THRESHOLD: f32 = 3.0;

/// Exact-match tolerance for discrete categories
const DISCRETE_EPSILON: f32 = 1e-6;

/// How one feature maps raw values to bins
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FeatureKind {
    /// Input already is an integer bin; clamp into range
    DenseFull,

    /// A fixed set of float categories
    Discrete,

    /// Custom bin edges over a continuous range
    CustomUniform,
}

impl From<FeatureKind> for u8 {
    fn from(value: FeatureKind) -> Self {
        match value {
            FeatureKind::DenseFull => 0,
            FeatureKind::Discrete => 1,
            FeatureKind::CustomUniform => 2,
        }
    }
}

impl TryFrom<u8> for FeatureKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::DenseFull),
            1 => Ok(Self::Discrete),
            2 => Ok(Self::CustomUniform),
            _ => Err(()),
        }
    }
}

/// An input that fell outside a feature's declared range.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DriftSample {
    /// Index of the drifting feature
    pub feature: u16,

    /// The raw value that was observed
    pub value: f32,
}

#[derive(Clone, Debug, PartialEq)]
enum Payload {
    Dense,

    /// Float categories, matched within [`DISCRETE_EPSILON`]
    Discrete(Vec<f32>),

    /// Absolute bin edges, ascending; bin = count of edges below the value
    Edges(Vec<f32>),
}

#[derive(Clone, Debug, PartialEq)]
struct Feature {
    min: f32,
    max: f32,
    baseline_scaled: i64,
    scale: u64,
    payload: Payload,
}

impl Feature {
    fn kind(&self) -> FeatureKind {
        match self.payload {
            Payload::Dense => FeatureKind::DenseFull,
            Payload::Discrete(_) => FeatureKind::Discrete,
            Payload::Edges(_) => FeatureKind::CustomUniform,
        }
    }
}

/// Per-feature mean/spread used for outlier clipping
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FeatureStats {
    pub mean: f32,
    pub std_dev: f32,
}

/// Compact label-name dictionary: offsets into contiguous byte storage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct LabelDictionary {
    offsets: Vec<u16>,
    lengths: Vec<u8>,
    storage: Vec<u8>,
}

impl LabelDictionary {
    const UNSET: u16 = u16::MAX;

    fn store(&mut self, id: Label, text: &str) -> bool {
        let idx = usize::from(id);
        if self.offsets.len() <= idx {
            self.offsets.resize(idx + 1, Self::UNSET);
            self.lengths.resize(idx + 1, 0);
        }

        let bytes = text.as_bytes();
        let len = bytes.len().min(usize::from(MAX_LABEL_LENGTH));
        if self.storage.len() + len > usize::from(u16::MAX) {
            log::error!("label storage overflow");
            return false;
        }

        #[allow(clippy::cast_possible_truncation)]
        {
            self.offsets[idx] = self.storage.len() as u16;
            self.lengths[idx] = len as u8;
        }
        self.storage.extend_from_slice(&bytes[..len]);
        true
    }

    fn get(&self, id: Label) -> Option<&str> {
        let idx = usize::from(id);
        let offset = usize::from(*self.offsets.get(idx)?);
        if offset == usize::from(Self::UNSET) {
            return None;
        }
        let len = usize::from(self.lengths[idx]);
        std::str::from_utf8(&self.storage[offset..offset + len]).ok()
    }
}

/// Per-feature value-to-bin mapper with drift detection.
///
/// Serialized as `QTZ4`. Out-of-range inputs at inference time are clamped
/// into valid bins but reported through a [`DriftSample`]; a retrain can
/// then widen the ranges and emit a [`BinRemapFilter`] so stored datasets
/// follow without touching raw data.
#[derive(Clone, Debug, PartialEq)]
pub struct Quantizer {
    num_features: u16,
    groups_per_feature: u16,
    quant_bits: u8,
    num_labels: Label,
    outlier_z: f32,
    outlier_stats: Option<Vec<FeatureStats>>,
    features: Vec<Feature>,
    labels: LabelDictionary,
}

/// Computes the scaling factor so `range * scale` fits a u16.
fn compute_scale(range: f32) -> u64 {
    if range <= 1e-9 {
        return 1;
    }
    let raw = f64::from(u16::MAX) / f64::from(range);
    if raw < 1.0 {
        1
    } else {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            (raw as u64).max(1)
        }
    }
}

/// Scales a float into the integer domain, rounding half away from zero.
fn scale_to_i64(value: f64, scale: u64) -> i64 {
    #[allow(clippy::cast_precision_loss)]
    let scaled = value * scale as f64;
    if scaled >= i64::MAX as f64 {
        return i64::MAX;
    }
    if scaled <= i64::MIN as f64 {
        return i64::MIN;
    }
    #[allow(clippy::cast_possible_truncation)]
    {
        if scaled >= 0.0 {
            (scaled + 0.5) as i64
        } else {
            (scaled - 0.5) as i64
        }
    }
}

impl Quantizer {
    /// Creates a quantizer with all features set to [`FeatureKind::DenseFull`].
    ///
    /// # Panics
    ///
    /// Panics if `quant_bits` is not in `1..=8`.
    #[must_use]
    pub fn new(num_features: u16, quant_bits: u8) -> Self {
        assert!(
            (1..=8).contains(&quant_bits),
            "invalid quantization coefficient: {quant_bits}"
        );
        let groups = 1u16 << quant_bits;

        let features = (0..num_features)
            .map(|_| Feature {
                min: 0.0,
                max: f32::from(groups - 1),
                baseline_scaled: 0,
                scale: 1,
                payload: Payload::Dense,
            })
            .collect();

        Self {
            num_features,
            groups_per_feature: groups,
            quant_bits,
            num_labels: 0,
            outlier_z: OUTLIER_Z_THRESHOLD,
            outlier_stats: None,
            features,
            labels: LabelDictionary::default(),
        }
    }

    #[must_use]
    pub fn num_features(&self) -> u16 {
        self.num_features
    }

    #[must_use]
    pub fn groups_per_feature(&self) -> u16 {
        self.groups_per_feature
    }

    /// Bits per stored bin.
    #[must_use]
    pub fn quantization_coefficient(&self) -> u8 {
        self.quant_bits
    }

    #[must_use]
    pub fn num_labels(&self) -> Label {
        self.num_labels
    }

    /// Declared range of a feature.
    #[must_use]
    pub fn feature_range(&self, feature: u16) -> Option<(f32, f32)> {
        let f = self.features.get(usize::from(feature))?;
        Some((f.min, f.max))
    }

    #[must_use]
    pub fn feature_kind(&self, feature: u16) -> Option<FeatureKind> {
        Some(self.features.get(usize::from(feature))?.kind())
    }

    /// Registers a label name; texts longer than 32 bytes are truncated.
    pub fn store_label(&mut self, id: Label, text: &str) -> bool {
        if !self.labels.store(id, text) {
            return false;
        }
        if id >= self.num_labels {
            self.num_labels = id + 1;
        }
        true
    }

    /// Returns a label's registered text.
    #[must_use]
    pub fn label_text(&self, id: Label) -> Option<&str> {
        self.labels.get(id)
    }

    /// Configures a feature with custom continuous bin edges.
    ///
    /// # Panics
    ///
    /// Panics if the feature index or edge count is out of range.
    pub fn set_feature_custom_edges(&mut self, feature: u16, min: f32, max: f32, edges: &[f32]) {
        assert!(feature < self.num_features, "feature index out of range");
        assert!(
            edges.len() < usize::from(self.groups_per_feature),
            "too many edges for {} bins",
            self.groups_per_feature
        );

        let scale = compute_scale(max - min);
        let slot = &mut self.features[usize::from(feature)];
        slot.min = min;
        slot.max = max;
        slot.scale = scale;
        slot.baseline_scaled = scale_to_i64(f64::from(min), scale);
        slot.payload = Payload::Edges(edges.to_vec());
    }

    /// Configures a feature with uniform bin edges over `[min, max]`.
    pub fn set_feature_uniform(&mut self, feature: u16, min: f32, max: f32) {
        let bins = f32::from(self.groups_per_feature);
        let edges: Vec<f32> = (1..self.groups_per_feature)
            .map(|i| min + (max - min) * f32::from(i) / bins)
            .collect();
        self.set_feature_custom_edges(feature, min, max, &edges);
    }

    /// Configures a feature with discrete float categories.
    ///
    /// # Panics
    ///
    /// Panics if the feature index or category count is out of range.
    pub fn set_feature_discrete(&mut self, feature: u16, values: &[f32]) {
        assert!(feature < self.num_features, "feature index out of range");
        assert!(
            values.len() <= usize::from(self.groups_per_feature),
            "too many categories for {} bins",
            self.groups_per_feature
        );

        let min = values.iter().copied().fold(f32::INFINITY, f32::min);
        let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        let slot = &mut self.features[usize::from(feature)];
        slot.min = min;
        slot.max = max;
        slot.scale = 1;
        slot.baseline_scaled = 0;
        slot.payload = Payload::Discrete(values.to_vec());
    }

    /// Attaches per-feature outlier statistics for z-score clipping.
    ///
    /// # Panics
    ///
    /// Panics if the stats count does not match the feature count.
    pub fn set_outlier_stats(&mut self, stats: Vec<FeatureStats>) {
        assert_eq!(
            stats.len(),
            usize::from(self.num_features),
            "stats count must match feature count"
        );
        self.outlier_stats = Some(stats);
    }

    fn clip_outlier(&self, feature: usize, value: f32) -> f32 {
        let Some(stats) = &self.outlier_stats else {
            return value;
        };
        let Some(s) = stats.get(feature) else {
            return value;
        };
        if s.std_dev <= 1e-6 {
            return value;
        }
        let z = (value - s.mean) / s.std_dev;
        if z > self.outlier_z {
            s.mean + self.outlier_z * s.std_dev
        } else if z < -self.outlier_z {
            s.mean - self.outlier_z * s.std_dev
        } else {
            value
        }
    }

    /// Quantizes one value; out-of-range inputs return a drift code.
    ///
    /// In-range results are `0..groups_per_feature`; underflow returns a
    /// negative code and overflow a code `>= groups_per_feature`, whose
    /// magnitude counts bin-widths beyond the declared range.
    #[must_use]
    pub fn quantize_value_signal(&self, feature: u16, value: f32) -> i32 {
        let idx = usize::from(feature);
        let Some(f) = self.features.get(idx) else {
            return 0;
        };

        let value = self.clip_outlier(idx, value);
        let gpf = i32::from(self.groups_per_feature);
        let under = value < f.min;
        let over = value > f.max;

        match &f.payload {
            Payload::Dense => {
                if under {
                    return -1;
                }
                if over {
                    return gpf;
                }
                #[allow(clippy::cast_possible_truncation)]
                let int_value = value as i32;
                int_value.clamp(0, gpf - 1)
            }

            Payload::Edges(edges) => {
                let span = f.max - f.min;
                #[allow(clippy::cast_precision_loss)]
                let bin_width = span / gpf as f32;

                if under {
                    if bin_width > 1e-9 {
                        #[allow(clippy::cast_possible_truncation)]
                        let extra = ((f.min - value) / bin_width).floor() as i32 + 1;
                        return -extra;
                    }
                    return -1;
                }
                if over {
                    if bin_width > 1e-9 {
                        #[allow(clippy::cast_possible_truncation)]
                        let extra = ((value - f.max) / bin_width).floor() as i32 + 1;
                        return (gpf - 1) + extra;
                    }
                    return gpf;
                }

                for (bin, edge) in edges.iter().enumerate() {
                    if value < *edge {
                        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                        return bin as i32;
                    }
                }
                #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                {
                    edges.len() as i32
                }
            }

            Payload::Discrete(values) => {
                for (bin, v) in values.iter().enumerate() {
                    if (v - value).abs() <= DISCRETE_EPSILON {
                        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                        return bin as i32;
                    }
                }
                // Unknown category is drift even when inside [min, max]
                if under {
                    -1
                } else {
                    gpf
                }
            }
        }
    }

    /// Quantizes a full feature vector into `out`.
    ///
    /// Stored bins are always clamped into `0..groups_per_feature`; the
    /// first out-of-range feature is reported as a [`DriftSample`].
    pub fn quantize_features(&self, values: &[f32], out: &mut PackedVector) -> Option<DriftSample> {
        debug_assert_eq!(values.len(), usize::from(self.num_features));

        if out.bits_per_value() != self.quant_bits {
            out.set_bits_per_value(self.quant_bits);
        }
        out.resize(values.len().min(usize::from(self.num_features)), 0);

        let gpf = i32::from(self.groups_per_feature);
        let mut drift = None;

        for (i, value) in values
            .iter()
            .enumerate()
            .take(usize::from(self.num_features))
        {
            #[allow(clippy::cast_possible_truncation)]
            let feature = i as u16;
            let q = self.quantize_value_signal(feature, *value);

            if drift.is_none() && (q < 0 || q >= gpf) {
                drift = Some(DriftSample {
                    feature,
                    value: *value,
                });
            }

            #[allow(clippy::cast_sign_loss)]
            let stored = q.clamp(0, gpf - 1) as usize;
            out.set_unchecked(i, stored);
        }

        drift
    }

    pub(crate) fn edges_of(&self, feature: u16) -> Option<&[f32]> {
        match &self.features.get(usize::from(feature))?.payload {
            Payload::Edges(edges) => Some(edges),
            _ => None,
        }
    }

    pub(crate) fn replace_continuous_feature(
        &mut self,
        feature: u16,
        min: f32,
        max: f32,
        edges: Vec<f32>,
    ) {
        let scale = compute_scale(max - min);
        let slot = &mut self.features[usize::from(feature)];
        slot.min = min;
        slot.max = max;
        slot.scale = scale;
        slot.baseline_scaled = scale_to_i64(f64::from(min), scale);
        slot.payload = Payload::Edges(edges);
    }

    pub(crate) fn widen_range(&mut self, feature: u16, min: f32, max: f32) {
        let slot = &mut self.features[usize::from(feature)];
        slot.min = min;
        slot.max = max;
    }
}

impl Encode for Quantizer {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&MAGIC_BYTES)?;
        writer.write_u16::<LittleEndian>(self.num_features)?;
        writer.write_u16::<LittleEndian>(self.groups_per_feature)?;
        writer.write_u8(self.num_labels)?;
        writer.write_u8(u8::from(self.outlier_stats.is_some()))?;

        if let Some(stats) = &self.outlier_stats {
            for s in stats {
                writer.write_f32::<LittleEndian>(s.mean)?;
                writer.write_f32::<LittleEndian>(s.std_dev)?;
            }
        }

        for id in 0..self.num_labels {
            let text = self.labels.get(id).unwrap_or_default();
            writer.write_u8(id)?;

            #[allow(clippy::cast_possible_truncation)]
            {
                writer.write_u8(text.len() as u8)?;
            }
            writer.write_all(text.as_bytes())?;
        }

        for f in &self.features {
            writer.write_u8(f.kind().into())?;
            writer.write_f32::<LittleEndian>(f.min)?;
            writer.write_f32::<LittleEndian>(f.max)?;
            writer.write_i64::<LittleEndian>(f.baseline_scaled)?;
            writer.write_u64::<LittleEndian>(f.scale)?;

            match &f.payload {
                Payload::Dense => {}
                Payload::Discrete(values) => {
                    #[allow(clippy::cast_possible_truncation)]
                    {
                        writer.write_u8(values.len() as u8)?;
                    }
                    for v in values {
                        writer.write_f32::<LittleEndian>(*v)?;
                    }
                }
                Payload::Edges(edges) => {
                    #[allow(clippy::cast_possible_truncation)]
                    {
                        writer.write_u8(edges.len() as u8)?;
                    }
                    for edge in edges {
                        let diff = f64::from(*edge) - f64::from(f.min);
                        #[allow(
                            clippy::cast_possible_truncation,
                            clippy::cast_sign_loss,
                            clippy::cast_precision_loss
                        )]
                        let scaled =
                            ((diff.max(0.0) * f.scale as f64) + 0.5).min(f64::from(u16::MAX));
                        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                        writer.write_u16::<LittleEndian>(scaled as u16)?;
                    }
                }
            }
        }

        Ok(())
    }
}

impl Decode for Quantizer {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut magic = [0u8; MAGIC_BYTES.len()];
        reader.read_exact(&mut magic)?;

        if magic != MAGIC_BYTES {
            return Err(DecodeError::InvalidHeader("Quantizer"));
        }

        let num_features = reader.read_u16::<LittleEndian>()?;
        let groups_per_feature = reader.read_u16::<LittleEndian>()?;
        let label_count = reader.read_u8()?;
        let outlier_flag = reader.read_u8()?;

        if groups_per_feature == 0 {
            return Err(DecodeError::InvalidHeader("Quantizer"));
        }

        let mut quant_bits = 0u8;
        let mut temp = groups_per_feature;
        while temp > 1 {
            temp >>= 1;
            quant_bits += 1;
        }
        let quant_bits = quant_bits.clamp(1, 8);

        let outlier_stats = if outlier_flag != 0 {
            let mut stats = Vec::with_capacity(usize::from(num_features));
            for _ in 0..num_features {
                let mean = reader.read_f32::<LittleEndian>()?;
                let std_dev = reader.read_f32::<LittleEndian>()?;
                stats.push(FeatureStats { mean, std_dev });
            }
            Some(stats)
        } else {
            None
        };

        let mut labels = LabelDictionary::default();
        let mut num_labels: Label = 0;
        for _ in 0..label_count {
            let id = reader.read_u8()?;
            let len = reader.read_u8()?;
            let mut buf = vec![0u8; usize::from(len)];
            reader.read_exact(&mut buf)?;

            if u16::from(id) >= u16::from(MAX_LABELS) {
                return Err(DecodeError::InvalidTag(("LabelId", id)));
            }
            let text = String::from_utf8_lossy(&buf);
            labels.store(id, &text);
            if id >= num_labels {
                num_labels = id + 1;
            }
        }

        let mut features = Vec::with_capacity(usize::from(num_features));
        for _ in 0..num_features {
            let kind_raw = reader.read_u8()?;
            let kind = FeatureKind::try_from(kind_raw)
                .map_err(|()| DecodeError::InvalidTag(("FeatureKind", kind_raw)))?;

            let min = reader.read_f32::<LittleEndian>()?;
            let max = reader.read_f32::<LittleEndian>()?;
            let baseline_scaled = reader.read_i64::<LittleEndian>()?;
            let scale = reader.read_u64::<LittleEndian>()?;
            let scale = if scale == 0 { 1 } else { scale };

            let payload = match kind {
                FeatureKind::DenseFull => Payload::Dense,
                FeatureKind::Discrete => {
                    let count = reader.read_u8()?;
                    let mut values = Vec::with_capacity(usize::from(count));
                    for _ in 0..count {
                        values.push(reader.read_f32::<LittleEndian>()?);
                    }
                    Payload::Discrete(values)
                }
                FeatureKind::CustomUniform => {
                    let count = reader.read_u8()?;
                    let mut edges = Vec::with_capacity(usize::from(count));
                    for _ in 0..count {
                        let scaled = reader.read_u16::<LittleEndian>()?;
                        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
                        let edge = (f64::from(min) + f64::from(scaled) / scale as f64) as f32;
                        edges.push(edge);
                    }
                    Payload::Edges(edges)
                }
            };

            features.push(Feature {
                min,
                max,
                baseline_scaled,
                scale,
                payload,
            });
        }

        Ok(Self {
            num_features,
            groups_per_feature,
            quant_bits,
            num_labels,
            outlier_z: OUTLIER_Z_THRESHOLD,
            outlier_stats,
            features,
            labels,
        })
    }
}
