// Copyright (c) 2024-present, microforest-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{BinRemapFilter, DriftSample, FeatureKind, Quantizer};
use crate::dataset::Dataset;

/// Absolute bounds of one bin given the edge list.
fn bin_bounds(min: f32, max: f32, edges: &[f32], bin: usize) -> (f32, f32) {
    if bin == 0 {
        return (min, edges.first().copied().unwrap_or(max));
    }
    if bin >= edges.len() {
        return (edges.last().copied().unwrap_or(min), max);
    }
    (edges[bin - 1], edges[bin])
}

/// Picks the new bin with the most absolute overlap.
///
/// Near-ties resolve to the old bin index when it is among the best, so a
/// range that only widened keeps stored bins stable.
fn best_overlap_bin(
    old_bounds: (f32, f32),
    new_min: f32,
    new_max: f32,
    new_edges: &[f32],
    bins: u16,
    old_bin: u16,
) -> u8 {
    let (o_lo, o_hi) = old_bounds;
    let o_width = o_hi - o_lo;

    if o_width <= 0.0 {
        // Degenerate old bin: place its midpoint
        for new_bin in 0..usize::from(bins) {
            let (n_lo, n_hi) = bin_bounds(new_min, new_max, new_edges, new_bin);
            if o_lo >= n_lo && o_lo <= n_hi {
                #[allow(clippy::cast_possible_truncation)]
                return new_bin as u8;
            }
        }
        return 0;
    }

    let tolerance = o_width * 1e-4;
    let mut best_overlap = -1.0f32;
    let mut best_bin = 0u8;

    for new_bin in 0..usize::from(bins) {
        let (n_lo, n_hi) = bin_bounds(new_min, new_max, new_edges, new_bin);
        let overlap = (o_hi.min(n_hi) - o_lo.max(n_lo)).max(0.0);

        let better = overlap > best_overlap + tolerance;
        let tied = (overlap - best_overlap).abs() <= tolerance;

        if better || (tied && new_bin == usize::from(old_bin)) {
            best_overlap = best_overlap.max(overlap);
            #[allow(clippy::cast_possible_truncation)]
            {
                best_bin = new_bin as u8;
            }
        }
    }

    best_bin
}

impl Quantizer {
    /// Widens feature ranges to cover the recorded drift samples.
    ///
    /// Continuous features keep each edge's fractional position within the
    /// range, so bins only widen. Returns the `old_bin -> new_bin` filter to
    /// apply to stored datasets; non-continuous features get an identity
    /// mapping with an updated range. Returns `None` when there is nothing
    /// to update.
    pub fn apply_concept_drift_update(
        &mut self,
        drift_samples: &[DriftSample],
    ) -> Option<BinRemapFilter> {
        if self.num_features() == 0 || self.groups_per_feature() == 0 || drift_samples.is_empty() {
            return None;
        }

        let num_features = self.num_features();
        let bins = self.groups_per_feature();
        let mut filter = BinRemapFilter::identity(num_features, bins);

        let mut new_mins: Vec<f32> = Vec::with_capacity(usize::from(num_features));
        let mut new_maxs: Vec<f32> = Vec::with_capacity(usize::from(num_features));
        for f in 0..num_features {
            let (min, max) = self.feature_range(f).expect("feature should exist");
            new_mins.push(min);
            new_maxs.push(max);
        }

        for ds in drift_samples {
            if ds.feature >= num_features {
                continue;
            }
            let idx = usize::from(ds.feature);
            if ds.value < new_mins[idx] {
                new_mins[idx] = ds.value;
            }
            if ds.value > new_maxs[idx] {
                new_maxs[idx] = ds.value;
            }
        }

        for f in 0..num_features {
            let idx = usize::from(f);
            let (old_min, old_max) = self.feature_range(f).expect("feature should exist");
            let (nm, nx) = (new_mins[idx], new_maxs[idx]);
            if nm >= old_min && nx <= old_max {
                continue;
            }

            if self.feature_kind(f) != Some(FeatureKind::CustomUniform) {
                self.widen_range(f, nm, nx);
                continue;
            }

            let old_edges: Vec<f32> = self.edges_of(f).expect("continuous feature").to_vec();
            let old_range = old_max - old_min;
            let new_range = nx - nm;

            let new_edges: Vec<f32> = if old_range > 1e-9 && new_range > 1e-9 {
                old_edges
                    .iter()
                    .map(|edge| {
                        let frac = ((edge - old_min) / old_range).clamp(0.0, 1.0);
                        nm + frac * new_range
                    })
                    .collect()
            } else if new_range > 1e-9 && bins > 1 {
                // Degenerate old range: fall back to uniform edges
                (0..old_edges.len())
                    .map(|i| {
                        #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
                        let frac = (i + 1) as f32 / f32::from(bins);
                        nm + frac * new_range
                    })
                    .collect()
            } else {
                vec![nm; old_edges.len()]
            };

            for old_bin in 0..bins {
                let bounds = bin_bounds(old_min, old_max, &old_edges, usize::from(old_bin));
                let best = best_overlap_bin(bounds, nm, nx, &new_edges, bins, old_bin);
                #[allow(clippy::cast_possible_truncation)]
                filter.set_mapping(f, old_bin as u8, best);
            }

            self.replace_continuous_feature(f, nm, nx, new_edges);
        }

        Some(filter)
    }

    /// Tightens continuous ranges whose extreme bins have gone empty.
    ///
    /// Intended for FIFO datasets: once old samples are evicted, the lowest
    /// or highest bins may hold nothing. At most `max_shrink` bins are
    /// dropped per end, only when every loaded sample misses them, and at
    /// least one bin must survive. The remap is written into the loaded
    /// dataset immediately; the returned filter covers the next disk load.
    pub fn apply_fifo_bin_shrink(
        &mut self,
        loaded: &mut Dataset,
        max_shrink: u8,
    ) -> Option<BinRemapFilter> {
        if self.num_features() == 0 || self.groups_per_feature() == 0 {
            return None;
        }
        if !loaded.is_loaded() || loaded.is_empty() {
            return None;
        }
        if loaded.total_features() != self.num_features() {
            return None;
        }

        let num_features = self.num_features();
        let gpf = self.groups_per_feature();
        let expected_edges = usize::from(gpf - 1);

        let mut filter = BinRemapFilter::identity(num_features, gpf);
        let mut changed_any = false;
        let mut counts = vec![0u32; usize::from(gpf)];

        for f in 0..num_features {
            if self.feature_kind(f) != Some(FeatureKind::CustomUniform) {
                continue;
            }

            counts.fill(0);
            for sample in 0..loaded.len() {
                let bin = loaded.get_feature(sample, f);
                if bin < usize::from(gpf) {
                    counts[bin] += 1;
                }
            }

            let mut low_shift = 0u16;
            while low_shift < u16::from(max_shrink)
                && low_shift < gpf
                && counts[usize::from(low_shift)] == 0
            {
                low_shift += 1;
            }
            let mut high_drop = 0u16;
            while high_drop < u16::from(max_shrink)
                && high_drop < gpf
                && counts[usize::from(gpf - 1 - high_drop)] == 0
            {
                high_drop += 1;
            }

            if low_shift == 0 && high_drop == 0 {
                continue;
            }
            // At least one bin must survive the collapse
            if low_shift + high_drop >= gpf {
                continue;
            }

            let (old_min, old_max) = self.feature_range(f).expect("feature should exist");
            let old_edges: Vec<f32> = match self.edges_of(f) {
                Some(edges) if edges.len() == expected_edges => edges.to_vec(),
                _ => continue,
            };

            let mut new_min = old_min;
            let mut new_max = old_max;
            if low_shift > 0 {
                new_min = old_edges[usize::from(low_shift - 1)];
            }
            if high_drop > 0 {
                new_max = old_edges[usize::from(gpf - 1 - high_drop)];
            }
            if new_max <= new_min + 1e-9 {
                continue;
            }

            let last_kept = gpf - 1 - high_drop;
            for old_bin in 0..gpf {
                let shifted = old_bin.saturating_sub(low_shift).min(last_kept);
                #[allow(clippy::cast_possible_truncation)]
                filter.set_mapping(f, old_bin as u8, shifted as u8);
            }

            // Shift surviving boundaries left; collapsed high edges pin to the
            // new maximum
            let kept_edges = expected_edges.saturating_sub(usize::from(high_drop));
            let new_edges: Vec<f32> = (0..expected_edges)
                .map(|i| {
                    let src = i + usize::from(low_shift);
                    if src < kept_edges {
                        old_edges[src]
                    } else {
                        new_max
                    }
                })
                .collect();

            self.replace_continuous_feature(f, new_min, new_max, new_edges);
            changed_any = true;
        }

        if !changed_any {
            return None;
        }

        // Training must see the tightened bins immediately; the stored copy
        // follows on the next load
        loaded.apply_update_filter_inplace(&filter);
        Some(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn drift_update_widens_range_with_identity_mapping() {
        // Range [0,10] with 4 bins at 2.5/5/7.5; drift to [-1,12]
        let mut q = Quantizer::new(1, 2);
        q.set_feature_custom_edges(0, 0.0, 10.0, &[2.5, 5.0, 7.5]);

        let filter = q
            .apply_concept_drift_update(&[
                DriftSample {
                    feature: 0,
                    value: 12.0,
                },
                DriftSample {
                    feature: 0,
                    value: -1.0,
                },
            ])
            .expect("update should apply");

        let (min, max) = q.feature_range(0).expect("feature should exist");
        assert!((min - -1.0).abs() < 1e-6);
        assert!((max - 12.0).abs() < 1e-6);

        // Bins only widened, so every old bin keeps its index
        for bin in 0..4 {
            assert_eq!(bin, filter.map(0, bin));
        }
        assert!(filter.is_identity());

        // Edges preserved their fractional positions within the range
        let edges = q.edges_of(0).expect("should have edges");
        assert!((edges[0] - 2.25).abs() < 1e-4);
        assert!((edges[1] - 5.5).abs() < 1e-4);
        assert!((edges[2] - 8.75).abs() < 1e-4);
    }

    #[test]
    fn drift_update_covers_every_sample() {
        let mut q = Quantizer::new(2, 3);
        q.set_feature_uniform(0, 0.0, 1.0);
        q.set_feature_uniform(1, -4.0, 4.0);

        let samples = [
            DriftSample {
                feature: 0,
                value: 3.5,
            },
            DriftSample {
                feature: 1,
                value: -9.0,
            },
            DriftSample {
                feature: 1,
                value: 11.0,
            },
        ];

        let filter = q
            .apply_concept_drift_update(&samples)
            .expect("update should apply");

        for ds in &samples {
            let (min, max) = q.feature_range(ds.feature).expect("feature should exist");
            assert!(min <= ds.value && ds.value <= max);
            // The widened quantizer no longer reports drift for this value
            let code = q.quantize_value_signal(ds.feature, ds.value);
            assert!((0..i32::from(q.groups_per_feature())).contains(&code));
        }

        // Mapping stays total for every feature and bin
        for f in 0..2 {
            for bin in 0..8 {
                assert!(u16::from(filter.map(f, bin)) < q.groups_per_feature());
            }
        }
    }

    #[test]
    fn drift_update_ignores_in_range_samples() {
        let mut q = Quantizer::new(1, 2);
        q.set_feature_uniform(0, 0.0, 10.0);

        assert!(q
            .apply_concept_drift_update(&[DriftSample {
                feature: 0,
                value: 5.0,
            }])
            .is_some());

        let (min, max) = q.feature_range(0).expect("feature should exist");
        assert!((min - 0.0).abs() < f32::EPSILON);
        assert!((max - 10.0).abs() < f32::EPSILON);
    }

    #[test]
    fn drift_update_non_continuous_keeps_identity() {
        let mut q = Quantizer::new(1, 2);
        // DenseFull feature: range widens but bins never move
        let filter = q
            .apply_concept_drift_update(&[DriftSample {
                feature: 0,
                value: 7.0,
            }])
            .expect("update should apply");

        assert!(filter.is_identity());
        let (_, max) = q.feature_range(0).expect("feature should exist");
        assert!((max - 7.0).abs() < f32::EPSILON);
    }

    #[test]
    fn drift_update_empty_input_is_none() {
        let mut q = Quantizer::new(1, 2);
        assert!(q.apply_concept_drift_update(&[]).is_none());
    }
}
