use microforest::{BuildParams, Dataset, NodeLayout, PackedVector, Tree};
use std::io::Write;
use test_log::test;

/// Build-form and compact-form predictions must agree on every sample.
#[test]
fn compact_form_equivalence() -> microforest::Result<()> {
    let dir = tempfile::tempdir()?;
    let csv_path = dir.path().join("data.csv");

    // A non-trivial 3-label problem over two 2-bit features
    {
        let mut csv = std::fs::File::create(&csv_path)?;
        for f0 in 0..4u8 {
            for f1 in 0..4u8 {
                let label = match (f0, f1) {
                    (0..=1, _) => 0u8,
                    (_, 0..=1) => 1,
                    _ => 2,
                };
                writeln!(csv, "{label},{f0},{f1}")?;
            }
        }
    }

    let mut data = Dataset::new(dir.path().join("data.bin"), 2, 2, 3)?;
    data.convert_from_csv(&csv_path)?;
    data.load(true)?;

    let layout = NodeLayout::calculate(3, 2, 256, 2);
    let params = BuildParams {
        min_split: 2,
        min_leaf: 1,
        max_depth: 6,
        use_gini: true,
        impurity_threshold: 0.0,
        num_labels: 3,
        reserve_nodes: 64,
        queue_capacity: 30,
    };

    let mut tree = Tree::new(0);
    let ids: Vec<u32> = (0..16).collect();
    tree.build(&data, &ids, &params, &layout)?;

    let rows: Vec<PackedVector> = (0..16)
        .map(|i| {
            let mut row = PackedVector::with_bits(2);
            row.push(data.get_feature(i, 0));
            row.push(data.get_feature(i, 1));
            row
        })
        .collect();

    let build_predictions: Vec<u8> = rows
        .iter()
        .map(|row| tree.predict_build(row, &layout))
        .collect();

    // The tree separates the training data perfectly
    for (i, predicted) in build_predictions.iter().enumerate() {
        assert_eq!(data.get_label(i), *predicted, "sample {i}");
    }

    assert!(tree.convert_to_compact(&layout));

    let compact_predictions: Vec<u8> = rows
        .iter()
        .map(|row| tree.predict_features(row, &layout))
        .collect();

    assert_eq!(build_predictions, compact_predictions);

    Ok(())
}

/// Equivalence also holds for inputs the tree never saw.
#[test]
fn compact_form_equivalence_off_training_inputs() -> microforest::Result<()> {
    let dir = tempfile::tempdir()?;
    let csv_path = dir.path().join("data.csv");

    {
        let mut csv = std::fs::File::create(&csv_path)?;
        // Sparse training set; plenty of unseen feature combinations
        for (label, f0, f1, f2) in [
            (0u8, 0u8, 3u8, 1u8),
            (0, 1, 2, 0),
            (1, 3, 0, 2),
            (1, 2, 1, 3),
            (2, 0, 0, 0),
            (2, 3, 3, 3),
        ] {
            writeln!(csv, "{label},{f0},{f1},{f2}")?;
        }
    }

    let mut data = Dataset::new(dir.path().join("data.bin"), 2, 3, 3)?;
    data.convert_from_csv(&csv_path)?;
    data.load(true)?;

    let layout = NodeLayout::calculate(3, 3, 256, 2);
    let params = BuildParams {
        min_split: 2,
        min_leaf: 1,
        max_depth: 8,
        use_gini: false,
        impurity_threshold: 0.0,
        num_labels: 3,
        reserve_nodes: 64,
        queue_capacity: 30,
    };

    let mut tree = Tree::new(0);
    tree.build(&data, &[0, 1, 2, 3, 4, 5], &params, &layout)?;

    let mut build_predictions = Vec::new();
    for f0 in 0..4usize {
        for f1 in 0..4usize {
            for f2 in 0..4usize {
                let mut row = PackedVector::with_bits(2);
                row.push(f0);
                row.push(f1);
                row.push(f2);
                build_predictions.push(tree.predict_build(&row, &layout));
            }
        }
    }

    assert!(tree.convert_to_compact(&layout));

    let mut i = 0;
    for f0 in 0..4usize {
        for f1 in 0..4usize {
            for f2 in 0..4usize {
                let mut row = PackedVector::with_bits(2);
                row.push(f0);
                row.push(f1);
                row.push(f2);
                assert_eq!(
                    build_predictions[i],
                    tree.predict_features(&row, &layout),
                    "input ({f0},{f1},{f2})"
                );
                i += 1;
            }
        }
    }

    Ok(())
}
