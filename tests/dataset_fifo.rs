use microforest::{Dataset, Sample};
use std::io::Write;
use test_log::test;

fn seed_dataset(dir: &std::path::Path, count: u8) -> microforest::Result<Dataset> {
    let csv_path = dir.join("data.csv");
    {
        let mut csv = std::fs::File::create(&csv_path)?;
        for i in 0..count {
            writeln!(csv, "{},{},{}", i % 4, i % 8, (i + 1) % 8)?;
        }
    }

    let mut data = Dataset::new(dir.join("data.bin"), 3, 2, 4)?;
    data.convert_from_csv(&csv_path)?;
    Ok(data)
}

/// S4: appending past `max_samples` evicts the oldest records and reports
/// their labels.
#[test]
fn fifo_cap_evicts_oldest() -> microforest::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut data = seed_dataset(dir.path(), 10)?;

    let newcomer = Sample {
        label: 3,
        features: vec![7, 7],
    };
    let removed = data.add(&[newcomer.clone()], 8)?;

    // Labels of samples 0, 1, 2 (i % 4)
    assert_eq!(vec![0, 1, 2], removed);
    assert_eq!(8, data.len());

    data.load(true)?;

    // The sample previously at index 3 now sits at index 0
    assert_eq!(
        Some(Sample {
            label: 3,
            features: vec![3, 4],
        }),
        data.sample(0)
    );
    assert_eq!(Some(newcomer), data.sample(7));

    Ok(())
}

#[test]
fn fifo_cap_repeated_adds_stay_bounded() -> microforest::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut data = seed_dataset(dir.path(), 6)?;

    for round in 0..5u8 {
        data.add(
            &[Sample {
                label: round % 4,
                features: vec![round % 8, round % 8],
            }],
            6,
        )?;
        assert_eq!(6, data.len(), "round {round}");
    }

    data.load(true)?;
    // Last appended sample is the newest record
    assert_eq!(
        Some(Sample {
            label: 0,
            features: vec![4, 4],
        }),
        data.sample(5)
    );

    Ok(())
}

#[test]
fn add_without_cap_grows() -> microforest::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut data = seed_dataset(dir.path(), 4)?;

    let removed = data.add(
        &[
            Sample {
                label: 0,
                features: vec![1, 1],
            },
            Sample {
                label: 1,
                features: vec![2, 2],
            },
        ],
        0,
    )?;

    assert!(removed.is_empty());
    assert_eq!(6, data.len());

    Ok(())
}

#[test]
fn add_rejects_wrong_feature_count() -> microforest::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut data = seed_dataset(dir.path(), 4)?;

    let result = data.add(
        &[Sample {
            label: 0,
            features: vec![1, 2, 3],
        }],
        0,
    );
    assert!(result.is_err());

    // The file is untouched
    data.load(true)?;
    assert_eq!(4, data.len());

    Ok(())
}
