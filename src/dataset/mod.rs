// Copyright (c) 2024-present, microforest-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod convert;

use crate::{
    file::remove_if_exists, packed::PackedVector, quantizer::BinRemapFilter, Error, Label,
    MAX_FEATURES, MAX_SAMPLES,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    io::{BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

/// Upper bound for one chunk of packed samples
#[cfg(not(feature = "large-chunks"))]
const CHUNK_BYTE_LIMIT: usize = 8_192;

/// Upper bound for one chunk of packed samples
#[cfg(feature = "large-chunks")]
const CHUNK_BYTE_LIMIT: usize = 32_768;

/// Batch size for streaming records from disk
const READ_BATCH_BYTES: usize = 2_048;

/// Write buffer for serializing records back to disk
const WRITE_BUFFER_BYTES: usize = 512;

/// On-disk size budget for one dataset (SPIFFS-class storage)
const MAX_DATASET_BYTES: u64 = 4 * 1024 * 1024;

/// Size of the binary file header (u32 sample count + u16 feature count)
const HEADER_BYTES: u64 = 6;

/// One (label, quantized feature vector) pair.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Sample {
    pub label: Label,
    pub features: Vec<u8>,
}

/// Smallest supported bits-per-value covering `num_labels`.
fn label_bits(num_labels: u16) -> u8 {
    if num_labels <= 2 {
        1
    } else if num_labels <= 4 {
        2
    } else if num_labels <= 16 {
        4
    } else {
        8
    }
}

/// Extracts feature `index` from a packed record, LSB-first within bytes.
pub(crate) fn unpack_feature(packed: &[u8], index: usize, bits: u8) -> u8 {
    #[allow(clippy::cast_possible_truncation)]
    let mask = ((1u16 << bits) - 1) as u8;
    let bit_pos = index * usize::from(bits);
    let byte = bit_pos / 8;
    #[allow(clippy::cast_possible_truncation)]
    let offset = (bit_pos % 8) as u8;

    if offset + bits <= 8 {
        (packed[byte] >> offset) & mask
    } else {
        // Value spans two bytes
        let spill = 8 - offset;
        ((packed[byte] >> offset) | (packed[byte + 1] << spill)) & mask
    }
}

/// Writes feature `index` into a zero-initialized packed record.
pub(crate) fn pack_feature(packed: &mut [u8], index: usize, bits: u8, value: u8) {
    #[allow(clippy::cast_possible_truncation)]
    let mask = ((1u16 << bits) - 1) as u8;
    let value = value & mask;
    let bit_pos = index * usize::from(bits);
    let byte = bit_pos / 8;
    #[allow(clippy::cast_possible_truncation)]
    let offset = (bit_pos % 8) as u8;

    packed[byte] |= value << offset;
    if offset + bits > 8 {
        let spill = 8 - offset;
        packed[byte + 1] |= value >> spill;
    }
}

/// Chunked, bit-packed storage of quantized training samples.
///
/// Samples live in a binary file on flash; `load`/`release` toggle the RAM
/// footprint. In RAM, features are split across fixed-size packed chunks so
/// no single allocation exceeds the chunk budget. A pending
/// [`BinRemapFilter`] left by a quantizer update is applied in place on the
/// next load.
#[derive(Clone, Debug)]
pub struct Dataset {
    path: PathBuf,
    chunks: Vec<PackedVector>,
    labels: PackedVector,
    num_features: u16,
    quant_bits: u8,
    samples_per_chunk: usize,
    len: usize,
    loaded: bool,
    update_filter: Option<BinRemapFilter>,
}

impl Dataset {
    /// Creates an unloaded dataset descriptor.
    ///
    /// `num_labels` only selects the label storage width; the file header
    /// carries the authoritative sample and feature counts.
    pub fn new(
        path: impl Into<PathBuf>,
        quant_bits: u8,
        num_features: u16,
        num_labels: u16,
    ) -> crate::Result<Self> {
        if !(1..=8).contains(&quant_bits) {
            return Err(Error::Incompatible("quantization coefficient out of range"));
        }
        if num_features == 0 || num_features > MAX_FEATURES {
            return Err(Error::Incompatible("feature count out of range"));
        }

        let bits_per_sample = usize::from(num_features) * usize::from(quant_bits);
        let samples_per_chunk = ((CHUNK_BYTE_LIMIT * 8) / bits_per_sample).max(1);
        let path = path.into();

        log::debug!("dataset initialized ({samples_per_chunk} samples/chunk): {path:?}");

        Ok(Self {
            path,
            chunks: Vec::new(),
            labels: PackedVector::with_bits(label_bits(num_labels)),
            num_features,
            quant_bits,
            samples_per_chunk,
            len: 0,
            loaded: false,
            update_filter: None,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Number of samples (on disk when unloaded, in RAM when loaded).
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn total_features(&self) -> u16 {
        self.num_features
    }

    /// Bits per stored feature value.
    #[must_use]
    pub fn quantization_coefficient(&self) -> u8 {
        self.quant_bits
    }

    #[must_use]
    pub fn bits_per_label(&self) -> u8 {
        self.labels.bits_per_value()
    }

    #[must_use]
    pub fn samples_per_chunk(&self) -> usize {
        self.samples_per_chunk
    }

    #[must_use]
    pub fn total_chunks(&self) -> usize {
        self.len.div_ceil(self.samples_per_chunk)
    }

    fn packed_feature_bytes(&self) -> usize {
        (usize::from(self.num_features) * usize::from(self.quant_bits)).div_ceil(8)
    }

    fn record_size(&self) -> usize {
        1 + self.packed_feature_bytes()
    }

    fn chunk_location(&self, sample: usize) -> (usize, usize) {
        (
            sample / self.samples_per_chunk,
            sample % self.samples_per_chunk,
        )
    }

    fn ensure_chunk_capacity(&mut self, total_samples: usize) {
        let required = total_samples.div_ceil(self.samples_per_chunk);
        while self.chunks.len() < required {
            let mut chunk = PackedVector::with_bits(self.quant_bits);
            chunk.reserve(self.samples_per_chunk * usize::from(self.num_features));
            self.chunks.push(chunk);
        }
    }

    /// Stores a sample at `index`, growing chunks as needed.
    pub(crate) fn store_sample(&mut self, index: usize, label: Label, features: &[u8]) {
        if index == self.labels.len() {
            self.labels.push(usize::from(label));
        } else if index < self.labels.len() {
            self.labels.set(index, usize::from(label));
        } else {
            self.labels.resize(index, 0);
            self.labels.push(usize::from(label));
        }

        self.ensure_chunk_capacity(index + 1);

        let (chunk_index, local_index) = self.chunk_location(index);
        let elements = usize::from(self.num_features);
        let start = local_index * elements;
        let required = start + elements;

        let chunk = &mut self.chunks[chunk_index];
        if chunk.len() < required {
            chunk.resize(required, 0);
        }
        for (j, value) in features.iter().enumerate().take(elements) {
            chunk.set(start + j, usize::from(*value));
        }

        if index >= self.len {
            self.len = index + 1;
        }
    }

    /// O(1) feature access for training hot paths.
    ///
    /// Out-of-bounds access returns 0 rather than panicking.
    #[must_use]
    pub fn get_feature(&self, sample: usize, feature: u16) -> usize {
        if sample >= self.len || feature >= self.num_features {
            return 0;
        }
        let (chunk_index, local_index) = self.chunk_location(sample);
        let Some(chunk) = self.chunks.get(chunk_index) else {
            return 0;
        };
        let element = local_index * usize::from(self.num_features) + usize::from(feature);
        if element >= chunk.len() {
            return 0;
        }
        chunk.get(element)
    }

    /// O(1) label access.
    #[must_use]
    pub fn get_label(&self, sample: usize) -> Label {
        if sample >= self.labels.len() {
            return 0;
        }
        #[allow(clippy::cast_possible_truncation)]
        {
            self.labels.get(sample) as Label
        }
    }

    /// Reconstructs a full sample from chunked storage.
    #[must_use]
    pub fn sample(&self, index: usize) -> Option<Sample> {
        if !self.loaded || index >= self.len {
            return None;
        }
        let features = (0..self.num_features)
            .map(|f| {
                #[allow(clippy::cast_possible_truncation)]
                {
                    self.get_feature(index, f) as u8
                }
            })
            .collect();
        Some(Sample {
            label: self.get_label(index),
            features,
        })
    }

    /// Pre-sizes chunks and label storage for `n` samples.
    pub fn reserve(&mut self, n: usize) {
        self.labels.reserve(n);
        self.ensure_chunk_capacity(n);
    }

    /// Stores a pending remap to be applied on the next [`Dataset::load`].
    pub fn set_update_filter(&mut self, filter: BinRemapFilter) {
        self.update_filter = Some(filter);
    }

    #[must_use]
    pub fn update_filter(&self) -> Option<&BinRemapFilter> {
        self.update_filter.as_ref()
    }

    pub fn clear_update_filter(&mut self) {
        self.update_filter = None;
    }

    /// Rewrites every stored bin through the filter's mapping.
    ///
    /// Returns `false` when the dataset is not loaded or the filter's
    /// dimensions do not match.
    pub fn apply_update_filter_inplace(&mut self, filter: &BinRemapFilter) -> bool {
        if !self.loaded {
            return false;
        }
        if filter.num_features() != self.num_features
            || filter.groups_per_feature() != (1u16 << self.quant_bits)
        {
            return false;
        }

        let num_features = usize::from(self.num_features);
        let gpf = usize::from(filter.groups_per_feature());

        for chunk in &mut self.chunks {
            for element in 0..chunk.len() {
                #[allow(clippy::cast_possible_truncation)]
                let feature = (element % num_features) as u16;
                let old = chunk.get(element);
                if old < gpf {
                    #[allow(clippy::cast_possible_truncation)]
                    let new = filter.map(feature, old as u8);
                    chunk.set_unchecked(element, usize::from(new));
                }
            }
        }
        true
    }

    fn clear_ram(&mut self) {
        self.chunks.clear();
        self.chunks.shrink_to_fit();
        self.labels.clear();
        self.labels.fit();
        self.loaded = false;
    }

    /// Loads the dataset from its binary file into RAM.
    ///
    /// When `reuse` is `false` the file is removed after loading
    /// (single-load mode). Any I/O error aborts without leaving partial
    /// in-RAM state behind.
    pub fn load(&mut self, reuse: bool) -> crate::Result<()> {
        if self.loaded {
            return Ok(());
        }
        log::debug!("loading data from {:?}", self.path);

        match self.load_inner() {
            Ok(()) => {}
            Err(e) => {
                self.clear_ram();
                return Err(e);
            }
        }

        if let Some(filter) = self.update_filter.take() {
            if filter.num_features() == self.num_features
                && filter.groups_per_feature() == (1u16 << self.quant_bits)
            {
                log::debug!("applying pending quantizer update filter");
                self.apply_update_filter_inplace(&filter);
            }
            // One-shot application, matching or not
        }

        if !reuse {
            log::debug!("single-load mode, removing {:?}", self.path);
            remove_if_exists(&self.path)?;
        }

        log::debug!("data loaded ({} chunks): {:?}", self.chunks.len(), self.path);
        Ok(())
    }

    fn load_inner(&mut self) -> crate::Result<()> {
        let mut file = std::fs::File::open(&self.path)?;

        let num_samples = file.read_u32::<LittleEndian>()? as usize;
        let num_features = file.read_u16::<LittleEndian>()?;

        if num_features != self.num_features {
            log::error!(
                "feature count mismatch: expected {}, found {num_features}",
                self.num_features
            );
            return Err(Error::Incompatible("dataset feature count mismatch"));
        }

        let record_size = self.record_size();
        let packed_bytes = self.packed_feature_bytes();
        let elements = usize::from(self.num_features);

        // Pre-size labels and chunks so the unpack loop never reallocates
        self.labels.clear();
        self.labels.reserve(num_samples);
        self.chunks.clear();
        self.ensure_chunk_capacity(num_samples);

        let mut remaining = num_samples;
        for chunk in &mut self.chunks {
            let chunk_samples = remaining.min(self.samples_per_chunk);
            chunk.resize(chunk_samples * elements, 0);
            remaining -= chunk_samples;
            if remaining == 0 {
                break;
            }
        }

        let batch_samples = (READ_BATCH_BYTES / record_size).max(1);
        let mut batch = vec![0u8; batch_samples * record_size];

        let mut processed = 0usize;
        while processed < num_samples {
            let n = (num_samples - processed).min(batch_samples);
            let bytes = &mut batch[..n * record_size];
            file.read_exact(bytes)?;

            for bi in 0..n {
                let record = &bytes[bi * record_size..(bi + 1) * record_size];
                self.labels.push(usize::from(record[0]));

                let packed = &record[1..=packed_bytes];
                let sample_index = processed + bi;
                let (chunk_index, local_index) = self.chunk_location(sample_index);
                let start = local_index * elements;

                let chunk = &mut self.chunks[chunk_index];
                for j in 0..elements {
                    let value = unpack_feature(packed, j, self.quant_bits);
                    chunk.set_unchecked(start + j, usize::from(value));
                }
            }

            processed += n;
        }

        self.labels.fit();
        for chunk in &mut self.chunks {
            chunk.fit();
        }

        self.len = num_samples;
        self.loaded = true;
        Ok(())
    }

    /// Releases the RAM footprint.
    ///
    /// When `reuse` is `false`, the in-RAM samples are first serialized back
    /// to the binary file (the on-disk copy was consumed by a single-load or
    /// is stale).
    pub fn release(&mut self, reuse: bool) -> crate::Result<()> {
        if !self.loaded {
            return Ok(());
        }

        if !reuse {
            log::debug!("saving data to {:?} and clearing RAM", self.path);
            remove_if_exists(&self.path)?;

            let file = std::fs::File::create(&self.path)?;
            let mut writer = BufWriter::with_capacity(WRITE_BUFFER_BYTES, file);

            #[allow(clippy::cast_possible_truncation)]
            writer.write_u32::<LittleEndian>(self.len as u32)?;
            writer.write_u16::<LittleEndian>(self.num_features)?;

            let packed_bytes = self.packed_feature_bytes();
            let mut record = vec![0u8; packed_bytes];

            for i in 0..self.len {
                record.fill(0);
                for j in 0..usize::from(self.num_features) {
                    #[allow(clippy::cast_possible_truncation)]
                    let value = self.get_feature(i, j as u16) as u8;
                    pack_feature(&mut record, j, self.quant_bits, value);
                }
                writer.write_u8(self.get_label(i))?;
                writer.write_all(&record)?;
            }
            writer.flush()?;
            writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;

            // The persisted copy reflects any applied remapping
            self.update_filter = None;
        }

        self.clear_ram();
        log::debug!("data released ({} samples): {:?}", self.len, self.path);
        Ok(())
    }

    /// Builds an in-RAM dataset from selected samples of a source file.
    ///
    /// IDs are processed in ascending order; IDs beyond the source sample
    /// count are skipped. An I/O error clears any partially loaded state.
    pub fn load_subset(&mut self, source: &Dataset, ids: &[u32]) -> crate::Result<()> {
        match self.load_subset_inner(source, ids) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.clear_ram();
                self.len = 0;
                Err(e)
            }
        }
    }

    fn load_subset_inner(&mut self, source: &Dataset, ids: &[u32]) -> crate::Result<()> {
        let mut file = std::fs::File::open(&source.path)?;

        let num_samples = file.read_u32::<LittleEndian>()? as usize;
        let num_features = file.read_u16::<LittleEndian>()?;

        self.clear_ram();
        self.num_features = num_features;
        self.quant_bits = source.quant_bits;
        self.samples_per_chunk = source.samples_per_chunk;
        self.labels.set_bits_per_value(source.bits_per_label());
        self.len = 0;

        let packed_bytes = source.packed_feature_bytes();
        let record_size = source.record_size() as u64;

        let mut sorted_ids: Vec<u32> = ids.to_vec();
        sorted_ids.sort_unstable();

        self.labels.reserve(sorted_ids.len());

        let mut record = vec![0u8; packed_bytes];
        let mut features = vec![0u8; usize::from(num_features)];
        let mut added = 0usize;

        for id in sorted_ids {
            let id = id as usize;
            if id >= num_samples {
                log::warn!("sample id {id} exceeds source sample count {num_samples}");
                continue;
            }

            file.seek(SeekFrom::Start(HEADER_BYTES + id as u64 * record_size))?;
            let label = file.read_u8()?;
            file.read_exact(&mut record)?;

            for (j, slot) in features.iter_mut().enumerate() {
                *slot = unpack_feature(&record, j, self.quant_bits);
            }

            self.store_sample(added, label, &features);
            added += 1;
        }

        self.len = added;
        self.labels.fit();
        for chunk in &mut self.chunks {
            chunk.fit();
        }
        self.loaded = true;

        log::debug!("loaded {added} samples from {:?}", source.path);
        Ok(())
    }

    /// Appends samples directly to the binary file, without loading it.
    ///
    /// When `max_samples > 0` and the file would exceed it, the oldest
    /// records are evicted (FIFO) and their labels returned so per-label
    /// counts can be decremented without a reload. The absolute sample cap
    /// and the on-disk size budget are always enforced.
    pub fn add(&mut self, samples: &[Sample], max_samples: u32) -> crate::Result<Vec<Label>> {
        let mut removed = Vec::new();
        if samples.is_empty() {
            return Ok(removed);
        }

        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)?;

        let mut current = file.read_u32::<LittleEndian>()? as u64;
        let num_features = file.read_u16::<LittleEndian>()?;

        if num_features != self.num_features {
            return Err(Error::Incompatible("dataset feature count mismatch"));
        }
        for sample in samples {
            if sample.features.len() != usize::from(num_features) {
                return Err(Error::Incompatible("sample feature count mismatch"));
            }
        }

        let packed_bytes = self.packed_feature_bytes();
        let record_size = self.record_size() as u64;

        let mut new_count = current + samples.len() as u64;

        if max_samples > 0 && new_count > u64::from(max_samples) {
            let to_remove = (new_count - u64::from(max_samples)).min(current);
            log::debug!("applying max_samples limit {max_samples}, evicting {to_remove}");

            // Collect the labels of the evicted prefix
            for i in 0..to_remove {
                file.seek(SeekFrom::Start(HEADER_BYTES + i * record_size))?;
                removed.push(file.read_u8()?);
            }

            // Shift the surviving records to the file start
            let to_keep = current - to_remove;
            let mut buf = vec![0u8; record_size as usize];
            for i in 0..to_keep {
                file.seek(SeekFrom::Start(
                    HEADER_BYTES + (to_remove + i) * record_size,
                ))?;
                file.read_exact(&mut buf)?;
                file.seek(SeekFrom::Start(HEADER_BYTES + i * record_size))?;
                file.write_all(&buf)?;
            }

            current = to_keep;
            new_count = u64::from(max_samples);
        }

        if new_count > u64::from(MAX_SAMPLES) {
            log::warn!("reaching absolute sample cap, truncating append");
            new_count = u64::from(MAX_SAMPLES);
        }

        let size_cap = (MAX_DATASET_BYTES - HEADER_BYTES) / record_size;
        if new_count > size_cap {
            log::warn!("limiting samples by dataset size budget to {size_cap}");
            new_count = size_cap;
        }

        if new_count < current {
            return Err(Error::LimitExceeded("dataset is already at its cap"));
        }

        let to_write = (new_count - current) as usize;

        // Header first, then the appended records
        file.seek(SeekFrom::Start(0))?;
        #[allow(clippy::cast_possible_truncation)]
        file.write_u32::<LittleEndian>(new_count as u32)?;
        file.write_u16::<LittleEndian>(num_features)?;

        file.seek(SeekFrom::Start(HEADER_BYTES + current * record_size))?;

        let mut record = vec![0u8; packed_bytes];
        for sample in samples.iter().take(to_write) {
            record.fill(0);
            for (j, value) in sample.features.iter().enumerate() {
                pack_feature(&mut record, j, self.quant_bits, *value);
            }
            file.write_u8(sample.label)?;
            file.write_all(&record)?;
        }

        file.set_len(HEADER_BYTES + new_count * record_size)?;
        file.sync_all()?;

        self.len = new_count as usize;
        if self.loaded {
            log::warn!("dataset is loaded in RAM; reload for consistency");
        }

        log::debug!("wrote {to_write} samples to {:?}", self.path);
        Ok(removed)
    }

    /// Drops RAM state and removes the backing file.
    pub fn purge(&mut self) -> crate::Result<()> {
        self.clear_ram();
        self.len = 0;
        self.update_filter = None;
        remove_if_exists(&self.path)?;
        log::debug!("purged dataset {:?}", self.path);
        Ok(())
    }

    /// Marks in-RAM samples as loaded without touching the filesystem.
    #[cfg(test)]
    pub(crate) fn force_loaded(&mut self) {
        self.loaded = true;
    }

    /// Approximate heap footprint in bytes.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.labels.memory_usage()
            + self
                .chunks
                .iter()
                .map(PackedVector::memory_usage)
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn sample(label: Label, features: &[u8]) -> Sample {
        Sample {
            label,
            features: features.to_vec(),
        }
    }

    fn write_initial(dataset: &mut Dataset, samples: &[Sample]) -> crate::Result<()> {
        for (i, s) in samples.iter().enumerate() {
            dataset.store_sample(i, s.label, &s.features);
        }
        dataset.loaded = true;
        dataset.release(false)
    }

    #[test]
    fn pack_unpack_straddles_bytes() {
        // 3 bits per value straddles at feature 2 (bits 6..9)
        let mut packed = [0u8; 3];
        for (i, v) in [5u8, 2, 7, 1, 6].iter().enumerate() {
            pack_feature(&mut packed, i, 3, *v);
        }
        for (i, v) in [5u8, 2, 7, 1, 6].iter().enumerate() {
            assert_eq!(*v, unpack_feature(&packed, i, 3), "feature {i}");
        }
    }

    #[test]
    fn dataset_round_trip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.bin");

        let samples = [
            sample(0, &[0, 1, 2, 3]),
            sample(1, &[3, 2, 1, 0]),
            sample(2, &[1, 1, 1, 1]),
        ];

        let mut data = Dataset::new(&path, 2, 4, 3)?;
        write_initial(&mut data, &samples)?;
        assert!(!data.is_loaded());

        data.load(true)?;
        assert!(data.is_loaded());
        assert_eq!(3, data.len());

        for (i, s) in samples.iter().enumerate() {
            assert_eq!(Some(s.clone()), data.sample(i), "sample {i}");
        }

        // Byte-for-byte identity across save -> release -> load
        let before = std::fs::read(&path)?;
        data.release(false)?;
        let after = std::fs::read(&path)?;
        assert_eq!(before, after);

        Ok(())
    }

    #[test]
    fn dataset_fifo_eviction() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.bin");

        let initial: Vec<Sample> = (0..10).map(|i| sample(i % 4, &[i, i + 1])).collect();

        let mut data = Dataset::new(&path, 4, 2, 4)?;
        write_initial(&mut data, &initial)?;

        let removed = data.add(&[sample(3, &[9, 9])], 8)?;

        // 10 + 1 > 8, so the 3 oldest samples fall off the front
        assert_eq!(
            vec![initial[0].label, initial[1].label, initial[2].label],
            removed
        );
        assert_eq!(8, data.len());

        data.load(true)?;
        // The sample previously at index 3 now sits at index 0
        assert_eq!(Some(initial[3].clone()), data.sample(0));
        // And the appended sample is last
        assert_eq!(Some(sample(3, &[9, 9])), data.sample(7));

        Ok(())
    }

    #[test]
    fn dataset_add_appends_without_cap() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.bin");

        let mut data = Dataset::new(&path, 2, 3, 2)?;
        write_initial(&mut data, &[sample(0, &[1, 2, 3])])?;

        let removed = data.add(&[sample(1, &[3, 2, 1]), sample(0, &[0, 0, 0])], 0)?;
        assert!(removed.is_empty());
        assert_eq!(3, data.len());

        data.load(true)?;
        assert_eq!(Some(sample(1, &[3, 2, 1])), data.sample(1));

        Ok(())
    }

    #[test]
    fn dataset_load_rejects_feature_mismatch() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.bin");

        let mut data = Dataset::new(&path, 2, 4, 2)?;
        write_initial(&mut data, &[sample(0, &[0, 1, 2, 3])])?;

        let mut wrong = Dataset::new(&path, 2, 5, 2)?;
        assert!(matches!(
            wrong.load(true),
            Err(Error::Incompatible("dataset feature count mismatch"))
        ));
        assert!(!wrong.is_loaded());

        Ok(())
    }

    #[test]
    fn dataset_load_truncated_file_fails_clean() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.bin");

        let mut data = Dataset::new(&path, 2, 4, 2)?;
        write_initial(
            &mut data,
            &[sample(0, &[0, 1, 2, 3]), sample(1, &[1, 1, 1, 1])],
        )?;

        // Chop the last record short
        let bytes = std::fs::read(&path)?;
        std::fs::write(&path, &bytes[..bytes.len() - 1])?;

        assert!(data.load(true).is_err());
        assert!(!data.is_loaded());
        assert!(data.chunks.is_empty());

        Ok(())
    }

    #[test]
    fn dataset_subset_load() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.bin");

        let samples: Vec<Sample> = (0u8..20).map(|i| sample(i % 3, &[i % 4, 3 - i % 4])).collect();

        let mut source = Dataset::new(&path, 2, 2, 3)?;
        write_initial(&mut source, &samples)?;

        let mut subset = Dataset::new(dir.path().join("subset.bin"), 2, 2, 3)?;
        subset.load_subset(&source, &[15, 3, 7])?;

        assert_eq!(3, subset.len());
        // IDs are consumed in ascending order
        assert_eq!(Some(samples[3].clone()), subset.sample(0));
        assert_eq!(Some(samples[7].clone()), subset.sample(1));
        assert_eq!(Some(samples[15].clone()), subset.sample(2));

        Ok(())
    }

    #[test]
    fn dataset_pending_filter_applies_on_load() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.bin");

        let mut data = Dataset::new(&path, 2, 2, 2)?;
        write_initial(&mut data, &[sample(0, &[3, 0]), sample(1, &[2, 1])])?;

        let mut filter = BinRemapFilter::identity(2, 4);
        filter.set_mapping(0, 3, 1);
        filter.set_mapping(0, 2, 0);
        data.set_update_filter(filter);

        data.load(true)?;
        assert_eq!(Some(sample(0, &[1, 0])), data.sample(0));
        assert_eq!(Some(sample(1, &[0, 1])), data.sample(1));
        // One-shot application
        assert!(data.update_filter().is_none());

        Ok(())
    }

    #[test]
    fn dataset_filter_dimension_mismatch_is_rejected() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.bin");

        let mut data = Dataset::new(&path, 2, 2, 2)?;
        write_initial(&mut data, &[sample(0, &[3, 0])])?;
        data.load(true)?;

        let filter = BinRemapFilter::identity(5, 4);
        assert!(!data.apply_update_filter_inplace(&filter));

        Ok(())
    }

    #[test]
    fn dataset_purge_removes_file() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.bin");

        let mut data = Dataset::new(&path, 2, 2, 2)?;
        write_initial(&mut data, &[sample(0, &[1, 2])])?;
        assert!(path.exists());

        data.purge()?;
        assert!(!path.exists());
        assert_eq!(0, data.len());

        Ok(())
    }
}
