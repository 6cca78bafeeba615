// Copyright (c) 2024-present, microforest-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::Dataset;
use crate::{file::remove_if_exists, Label, MAX_SAMPLES};
use std::{
    io::{BufRead, BufReader},
    path::Path,
};

impl Dataset {
    /// One-shot conversion of a CSV dataset into the binary format.
    ///
    /// Each row is `label,f0,...,f_{F-1}` with integer values already
    /// quantized to the dataset's bit width. Rows with the wrong field count
    /// or unparsable numbers are logged and skipped. On success the CSV
    /// source is removed.
    pub fn convert_from_csv(&mut self, csv_path: &Path) -> crate::Result<()> {
        log::debug!("converting CSV to binary format: {csv_path:?}");

        if self.is_loaded() {
            self.release(true)?;
        }

        let file = std::fs::File::open(csv_path)?;
        let reader = BufReader::new(file);

        let num_features = usize::from(self.total_features());
        let mut features = vec![0u8; num_features];

        let mut lines_processed = 0usize;
        let mut empty_lines = 0usize;
        let mut valid_samples = 0usize;
        let mut invalid_samples = 0usize;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            lines_processed += 1;

            if line.is_empty() {
                empty_lines += 1;
                continue;
            }

            let mut fields = line.split(',');

            let label: Label = match fields.next().map(str::trim).map(str::parse) {
                Some(Ok(v)) => v,
                _ => {
                    log::warn!("invalid label in line {lines_processed}");
                    invalid_samples += 1;
                    continue;
                }
            };

            let mut count = 0usize;
            let mut ok = true;
            for field in fields {
                if count >= num_features {
                    ok = false;
                    break;
                }
                match field.trim().parse::<u8>() {
                    Ok(v) => {
                        features[count] = v;
                        count += 1;
                    }
                    Err(_) => {
                        ok = false;
                        break;
                    }
                }
            }

            if !ok || count != num_features {
                log::warn!("invalid field count in line {lines_processed}, expected {num_features}");
                invalid_samples += 1;
                continue;
            }

            self.store_sample(valid_samples, label, &features);
            valid_samples += 1;

            if valid_samples >= MAX_SAMPLES as usize {
                log::warn!("reached maximum sample limit");
                break;
            }
        }

        log::debug!(
            "CSV processed: {lines_processed} lines, {empty_lines} empty, \
             {valid_samples} valid, {invalid_samples} invalid"
        );

        self.loaded = true;
        self.len = valid_samples;

        // Persist as binary, then retire the CSV
        self.release(false)?;
        remove_if_exists(csv_path)?;

        log::debug!("CSV converted and removed: {csv_path:?}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Sample;
    use std::io::Write;
    use test_log::test;

    #[test]
    fn csv_conversion_round_trip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let csv_path = dir.path().join("data.csv");
        let bin_path = dir.path().join("data.bin");

        {
            let mut csv = std::fs::File::create(&csv_path)?;
            writeln!(csv, "0,1,2,3")?;
            writeln!(csv, "1,3,2,1")?;
            writeln!(csv)?;
            writeln!(csv, "1,0,0,0")?;
        }

        let mut data = Dataset::new(&bin_path, 2, 3, 2)?;
        data.convert_from_csv(&csv_path)?;

        // CSV consumed, binary written
        assert!(!csv_path.exists());
        assert!(bin_path.exists());

        data.load(true)?;
        assert_eq!(3, data.len());
        assert_eq!(
            Some(Sample {
                label: 0,
                features: vec![1, 2, 3],
            }),
            data.sample(0)
        );
        assert_eq!(
            Some(Sample {
                label: 1,
                features: vec![0, 0, 0],
            }),
            data.sample(2)
        );

        Ok(())
    }

    #[test]
    fn csv_conversion_skips_bad_rows() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let csv_path = dir.path().join("data.csv");
        let bin_path = dir.path().join("data.bin");

        {
            let mut csv = std::fs::File::create(&csv_path)?;
            writeln!(csv, "0,1,2")?;
            writeln!(csv, "not,a,row")?;
            writeln!(csv, "1,2")?;
            writeln!(csv, "1,2,3,4,5")?;
            writeln!(csv, "1,3,3")?;
        }

        let mut data = Dataset::new(&bin_path, 2, 2, 2)?;
        data.convert_from_csv(&csv_path)?;

        data.load(true)?;
        assert_eq!(2, data.len());
        assert_eq!(0, data.get_label(0));
        assert_eq!(1, data.get_label(1));

        Ok(())
    }
}
