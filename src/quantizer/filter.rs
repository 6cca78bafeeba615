// Copyright (c) 2024-present, microforest-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Per-feature `old_bin -> new_bin` table emitted by quantizer updates.
///
/// Applied to stored datasets so quantized samples follow a bin-boundary
/// change without re-quantizing raw data. The mapping is total: every
/// `(feature, bin)` pair has an entry, starting out as identity.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BinRemapFilter {
    num_features: u16,
    groups_per_feature: u16,
    table: Vec<u8>,
}

impl BinRemapFilter {
    /// Creates an identity filter.
    #[must_use]
    pub fn identity(num_features: u16, groups_per_feature: u16) -> Self {
        let groups = usize::from(groups_per_feature);
        let mut table = vec![0; usize::from(num_features) * groups];
        for chunk in table.chunks_mut(groups) {
            for (bin, slot) in chunk.iter_mut().enumerate() {
                #[allow(clippy::cast_possible_truncation)]
                {
                    *slot = bin as u8;
                }
            }
        }
        Self {
            num_features,
            groups_per_feature,
            table,
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

    /// Maps an old bin of a feature to its new bin.
    ///
    /// Out-of-range inputs map to themselves.
    #[must_use]
    pub fn map(&self, feature: u16, old_bin: u8) -> u8 {
        if feature >= self.num_features || u16::from(old_bin) >= self.groups_per_feature {
            return old_bin;
        }
        let idx =
            usize::from(feature) * usize::from(self.groups_per_feature) + usize::from(old_bin);
        self.table[idx]
    }

    /// Overwrites one mapping entry.
    pub fn set_mapping(&mut self, feature: u16, old_bin: u8, new_bin: u8) {
        if feature >= self.num_features || u16::from(old_bin) >= self.groups_per_feature {
            return;
        }
        let idx =
            usize::from(feature) * usize::from(self.groups_per_feature) + usize::from(old_bin);
        self.table[idx] = new_bin;
    }

    /// Returns `true` if no entry moves a bin.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        let groups = usize::from(self.groups_per_feature);
        self.table.chunks(groups).all(|chunk| {
            chunk
                .iter()
                .enumerate()
                .all(|(bin, &new_bin)| usize::from(new_bin) == bin)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn filter_starts_as_identity() {
        let f = BinRemapFilter::identity(3, 4);
        assert!(f.is_identity());
        for feature in 0..3 {
            for bin in 0..4 {
                assert_eq!(bin, f.map(feature, bin));
            }
        }
    }

    #[test]
    fn filter_set_and_map() {
        let mut f = BinRemapFilter::identity(2, 4);
        f.set_mapping(1, 3, 0);

        assert!(!f.is_identity());
        assert_eq!(0, f.map(1, 3));
        assert_eq!(3, f.map(0, 3));
    }

    #[test]
    fn filter_out_of_range_is_passthrough() {
        let f = BinRemapFilter::identity(1, 4);
        assert_eq!(7, f.map(0, 7));
        assert_eq!(2, f.map(9, 2));
    }
}
